//! Playback clock.
//!
//! Samples the presentation element at a fixed cadence (and immediately on
//! seek/stall-relevant element events) into a watch channel of
//! [`TimingsTick`] values every buffer and the orchestrator observe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::element::{buffer_gap_at, ElementEvent, MediaElement, ReadyState};

/// Sampling cadence; four ticks per second.
pub const SAMPLING_INTERVAL: Duration = Duration::from_millis(250);

/// Contiguous buffer ahead of the playhead below which a non-paused element
/// that cannot advance is considered stalled.
const STALL_GAP_SECS: f64 = 0.5;

/// One observation of the element clock.
#[derive(Clone, Debug, PartialEq)]
pub struct TimingsTick {
    pub current_time: f64,
    pub duration: f64,
    pub ready_state: ReadyState,
    pub playback_rate: f64,
    pub paused: bool,
    pub stalled: bool,
    /// Contiguous buffered media ahead of the playhead, seconds.
    pub buffer_gap: f64,
    /// True when the triggering element event was a seek.
    pub seeking: bool,
}

/// Sample the element into a tick.
#[must_use]
pub fn sample(element: &dyn MediaElement, seeking: bool) -> TimingsTick {
    let current_time = element.current_time();
    let buffered = element.buffered();
    let buffer_gap = buffer_gap_at(&buffered, current_time);
    let ready_state = element.ready_state();
    let paused = element.paused();
    let duration = element.duration();

    let at_end = duration.is_finite() && current_time >= duration - STALL_GAP_SECS;
    let stalled = !paused
        && !at_end
        && ready_state <= ReadyState::HaveCurrentData
        && buffer_gap < STALL_GAP_SECS;

    TimingsTick {
        current_time,
        duration,
        ready_state,
        playback_rate: element.playback_rate(),
        paused,
        stalled,
        buffer_gap,
        seeking,
    }
}

/// Clock source driving buffers and the orchestrator.
pub struct TimingSource;

impl TimingSource {
    /// Spawn the sampling task; the receiver always holds the latest tick.
    pub fn spawn(
        element: Arc<dyn MediaElement>,
        cancel: CancellationToken,
    ) -> watch::Receiver<TimingsTick> {
        let (tx, rx) = watch::channel(sample(element.as_ref(), false));
        let mut events = element.events();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAMPLING_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let tick = sample(element.as_ref(), false);
                        trace!(current_time = tick.current_time, stalled = tick.stalled, "clock tick");
                        if tx.send(tick).is_err() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Ok(event) => {
                            let seeking = matches!(event, ElementEvent::Seeking | ElementEvent::Seeked);
                            let tick = sample(element.as_ref(), seeking);
                            if tx.send(tick).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        rx
    }
}
