//! Adaptation buffer.
//!
//! One engine per (period, track). On every clock tick it computes the
//! wanted range, consults ABR, fetches the next uncovered segment through
//! the pipeline and appends it to the sink, garbage-collecting around the
//! playhead when the sink reports quota pressure. Representation switches
//! cancel the in-flight fetch and re-prepend the init segment.

use std::collections::HashSet;
use std::sync::Arc;

use aulos_abr::AbrCoordinator;
use aulos_events::{ErrorCode, TimeRange, TrackType};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use web_time::Instant;

use crate::element::SinkError;
use crate::errors::{PlayerError, PlayerResult};
use crate::ledger::{LedgerContent, SegmentLedger};
use crate::manifest::{Adaptation, Period, Representation};
use crate::pipeline::{SegmentPipeline, SegmentRequest};
use crate::surface::{init_payload, MediaSink};
use crate::timing::TimingsTick;

/// Tolerance when comparing a wanted-range end against the period end.
const PERIOD_END_EPSILON: f64 = 1e-6;

/// Live-edge guard: refresh when the wanted range comes this close to the
/// last indexed position.
const LIVE_EDGE_GUARD_SECS: f64 = 0.5;

/// Buffer lifecycle outputs, consumed by the orchestrator.
#[derive(Clone, Debug)]
pub enum BufferEvent {
    SegmentQueued {
        track: TrackType,
        segment_id: String,
    },
    /// Wanted range fully covered.
    Filled { track: TrackType, range: TimeRange },
    /// Period end reached and covered.
    Finished { track: TrackType, range: TimeRange },
    /// The index ran out of segments near the live edge.
    NeedsManifestRefresh { track: TrackType },
    RepresentationChanged {
        track: TrackType,
        representation_id: String,
        bitrate: u64,
    },
    Warning {
        track: TrackType,
        error: PlayerError,
    },
}

/// Buffer depth configuration.
#[derive(Clone, Copy, Debug)]
pub struct BufferConfig {
    pub wanted_buffer_ahead: f64,
    pub max_buffer_ahead: Option<f64>,
    pub max_buffer_behind: Option<f64>,
}

/// Everything a buffer needs at spawn time.
pub struct BufferParams {
    pub track: TrackType,
    pub period: Period,
    pub adaptation: Adaptation,
    /// Effective end of the presentation, bounding open periods.
    pub presentation_end: f64,
    pub is_live: bool,
    pub sink: Arc<dyn MediaSink>,
    pub ledger: Arc<Mutex<SegmentLedger>>,
    pub pipeline: SegmentPipeline,
    pub abr: Arc<Mutex<AbrCoordinator>>,
    pub config: BufferConfig,
    pub events: mpsc::Sender<BufferEvent>,
    pub clock: watch::Receiver<TimingsTick>,
    /// Appends block while this is false (protection not configured yet).
    pub append_gate: watch::Receiver<bool>,
    pub cancel: CancellationToken,
}

#[derive(Clone, Copy, PartialEq)]
enum Emitted {
    Filled(u64),
    Finished(u64),
}

/// Per-(period, track) buffering engine.
pub struct AdaptationBuffer {
    track: TrackType,
    period: Period,
    adaptation: Adaptation,
    period_bounds: TimeRange,
    is_live: bool,
    sink: Arc<dyn MediaSink>,
    ledger: Arc<Mutex<SegmentLedger>>,
    pipeline: SegmentPipeline,
    abr: Arc<Mutex<AbrCoordinator>>,
    config: BufferConfig,
    events: mpsc::Sender<BufferEvent>,
    clock: watch::Receiver<TimingsTick>,
    append_gate: watch::Receiver<bool>,
    cancel: CancellationToken,
    active_representation: Option<usize>,
    pending_init: bool,
    /// Ranges given up on after retry exhaustion or bad metadata.
    skipped: Vec<TimeRange>,
    skipped_ids: HashSet<String>,
    last_emitted: Option<Emitted>,
}

impl AdaptationBuffer {
    #[must_use]
    pub fn new(params: BufferParams) -> Self {
        let period_bounds = params.period.bounds(params.presentation_end);
        Self {
            track: params.track,
            period_bounds,
            period: params.period,
            adaptation: params.adaptation,
            is_live: params.is_live,
            sink: params.sink,
            ledger: params.ledger,
            pipeline: params.pipeline,
            abr: params.abr,
            config: params.config,
            events: params.events,
            clock: params.clock,
            append_gate: params.append_gate,
            cancel: params.cancel,
            active_representation: None,
            pending_init: false,
            skipped: Vec::new(),
            skipped_ids: HashSet::new(),
            last_emitted: None,
        }
    }

    /// Main loop: one `step` per clock tick until cancelled.
    pub async fn run(mut self) {
        debug!(track = %self.track, period = %self.period.id, "adaptation buffer started");
        loop {
            let tick = self.clock.borrow().clone();
            if let Err(error) = self.step(&tick).await {
                let _ = self
                    .events
                    .send(BufferEvent::Warning {
                        track: self.track,
                        error,
                    })
                    .await;
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                changed = self.clock.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.pipeline.cancel_inflight();
        debug!(track = %self.track, period = %self.period.id, "adaptation buffer stopped");
    }

    /// Fill the wanted range for this tick.
    async fn step(&mut self, tick: &TimingsTick) -> PlayerResult<()> {
        if tick.seeking {
            self.abr.lock().reset_buffer();
        }

        let wanted = TimeRange::new(
            tick.current_time,
            tick.current_time + self.config.wanted_buffer_ahead,
        )
        .clip(&self.period_bounds);

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let representation_index = self.select_representation().await?;
            let Some(representation_index) = representation_index else {
                return Ok(());
            };
            let representation = self.adaptation.representations[representation_index].clone();

            {
                let sink_ranges = self.sink.buffered();
                self.ledger.lock().synchronize(&sink_ranges);
            }

            let Some(hole) = self.next_hole(wanted) else {
                self.emit_coverage(wanted, &representation).await;
                return Ok(());
            };

            let lookup = TimeRange::new(hole, wanted.end);
            let segment = representation
                .index
                .segments_in(lookup)
                .into_iter()
                .find(|s| {
                    !self.skipped_ids.contains(&s.id) && (s.duration <= 0.0 || s.end() > hole)
                });

            let Some(segment) = segment else {
                // Covered up to the edge of what the index describes.
                self.emit_coverage(TimeRange::new(wanted.start, hole), &representation)
                    .await;
                return Ok(());
            };

            if segment.duration <= 0.0 {
                warn!(track = %self.track, segment = %segment.id, "skipping empty segment");
                self.skip(segment.id.clone(), segment.range());
                let _ = self
                    .events
                    .send(BufferEvent::Warning {
                        track: self.track,
                        error: PlayerError::media(
                            ErrorCode::BufferAppendError,
                            format!("segment {} has non-positive duration", segment.id),
                            false,
                        ),
                    })
                    .await;
                continue;
            }

            let request = SegmentRequest {
                track: self.track,
                period_id: self.period.id.clone(),
                adaptation_id: self.adaptation.id.clone(),
                representation: representation.clone(),
                segment,
            };

            if self.pending_init {
                self.append_init(&request).await?;
                self.pending_init = false;
            }

            let fetched = match self.pipeline.fetch(&request).await {
                Ok(fetched) => fetched,
                Err(error) => {
                    // Retry budget exhausted: skip the segment, keep going.
                    warn!(track = %self.track, segment = %request.segment.id, %error, "segment abandoned");
                    self.skip(request.segment.id.clone(), request.segment.range());
                    let _ = self
                        .events
                        .send(BufferEvent::Warning {
                            track: self.track,
                            error,
                        })
                        .await;
                    continue;
                }
            };

            self.wait_append_gate().await;
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match self.sink.append(fetched.payload.clone()).await {
                Ok(()) => {}
                Err(SinkError::QuotaExceeded) => {
                    debug!(track = %self.track, "sink quota exceeded, collecting");
                    self.collect_garbage(tick).await;
                    if let Err(error) = self.sink.append(fetched.payload.clone()).await {
                        let _ = self
                            .events
                            .send(BufferEvent::Warning {
                                track: self.track,
                                error: PlayerError::media(
                                    ErrorCode::BufferFull,
                                    format!("sink still full after GC: {error}"),
                                    false,
                                ),
                            })
                            .await;
                        return Ok(());
                    }
                }
                Err(error) => {
                    return Err(PlayerError::media(
                        ErrorCode::BufferAppendError,
                        error.to_string(),
                        false,
                    ));
                }
            }

            {
                let mut ledger = self.ledger.lock();
                ledger.insert(
                    LedgerContent {
                        period_id: self.period.id.clone(),
                        adaptation_id: self.adaptation.id.clone(),
                        representation_id: representation.id.clone(),
                        bitrate: representation.bitrate,
                    },
                    request.segment.id.clone(),
                    fetched.payload.range.start,
                    fetched.payload.range.end,
                )?;
            }

            trace!(
                track = %self.track,
                segment = %request.segment.id,
                start = fetched.payload.range.start,
                end = fetched.payload.range.end,
                "segment appended"
            );
            let _ = self
                .events
                .send(BufferEvent::SegmentQueued {
                    track: self.track,
                    segment_id: request.segment.id.clone(),
                })
                .await;
        }
    }

    /// Ask ABR for the representation; handles switch bookkeeping.
    async fn select_representation(&mut self) -> PlayerResult<Option<usize>> {
        let selection = {
            let mut abr = self.abr.lock();
            abr.select(&self.adaptation.candidates(), Instant::now())
        };
        let Some(selection) = selection else {
            return Ok(None);
        };

        if self.active_representation != Some(selection.index) {
            let representation = &self.adaptation.representations[selection.index];
            debug!(
                track = %self.track,
                representation = %representation.id,
                bitrate = representation.bitrate,
                reason = ?selection.reason,
                "representation switch"
            );
            // A switch abandons the previous representation's request and
            // forces the matching init segment before the next append.
            self.pipeline.cancel_inflight();
            self.active_representation = Some(selection.index);
            self.pending_init = true;
            let _ = self
                .events
                .send(BufferEvent::RepresentationChanged {
                    track: self.track,
                    representation_id: representation.id.clone(),
                    bitrate: representation.bitrate,
                })
                .await;
        }
        Ok(Some(selection.index))
    }

    async fn append_init(&mut self, request: &SegmentRequest) -> PlayerResult<()> {
        if let Some(bytes) = self.pipeline.fetch_init(request).await? {
            self.wait_append_gate().await;
            self.sink
                .append(init_payload(bytes))
                .await
                .map_err(|error| {
                    PlayerError::media(ErrorCode::BufferAppendError, error.to_string(), false)
                })?;
        }
        Ok(())
    }

    /// First uncovered point of `wanted`, looking past skipped ranges.
    fn next_hole(&self, wanted: TimeRange) -> Option<f64> {
        let mut hole = self.ledger.lock().first_hole_in(wanted)?;
        loop {
            if hole >= wanted.end {
                return None;
            }
            // Only strictly-covering skips advance the hole, so the loop
            // always makes progress.
            let Some(skip) = self
                .skipped
                .iter()
                .find(|s| s.start <= hole && s.end > hole)
            else {
                return Some(hole);
            };
            hole = skip.end;
            match self
                .ledger
                .lock()
                .first_hole_in(TimeRange::new(hole, wanted.end))
            {
                Some(next) => hole = next,
                None => return None,
            }
        }
    }

    fn skip(&mut self, id: String, range: TimeRange) {
        self.skipped_ids.insert(id);
        self.skipped.push(range);
    }

    /// Emit `Filled`/`Finished` (deduplicated) and live-edge refreshes.
    async fn emit_coverage(&mut self, covered: TimeRange, representation: &Representation) {
        let finished = covered.end >= self.period_bounds.end - PERIOD_END_EPSILON;
        let key = quantize(covered.end);
        let emitted = if finished {
            Emitted::Finished(key)
        } else {
            Emitted::Filled(key)
        };
        if self.last_emitted != Some(emitted) {
            self.last_emitted = Some(emitted);
            let event = if finished {
                BufferEvent::Finished {
                    track: self.track,
                    range: covered,
                }
            } else {
                BufferEvent::Filled {
                    track: self.track,
                    range: covered,
                }
            };
            let _ = self.events.send(event).await;
        }

        // Near the live edge the index runs dry; ask for a refresh on every
        // evaluation and let the orchestrator throttle the actual fetches.
        if self.is_live {
            if let Some(last) = representation.index.last_position() {
                if covered.end + LIVE_EDGE_GUARD_SECS >= last {
                    let _ = self
                        .events
                        .send(BufferEvent::NeedsManifestRefresh { track: self.track })
                        .await;
                }
            }
        }
    }

    /// Drop sink media outside the configured window around the playhead.
    async fn collect_garbage(&mut self, tick: &TimingsTick) {
        if let Some(behind) = self.config.max_buffer_behind {
            let horizon = tick.current_time - behind;
            if horizon > 0.0 {
                let _ = self.sink.remove(TimeRange::new(0.0, horizon)).await;
            }
        }
        if let Some(ahead) = self.config.max_buffer_ahead {
            let horizon = tick.current_time + ahead;
            if horizon < self.period_bounds.end {
                let _ = self
                    .sink
                    .remove(TimeRange::new(horizon, self.period_bounds.end))
                    .await;
            }
        }
        let sink_ranges = self.sink.buffered();
        self.ledger.lock().synchronize(&sink_ranges);
    }

    /// Block while appends are gated on protection set-up.
    async fn wait_append_gate(&mut self) {
        while !*self.append_gate.borrow() {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                changed = self.append_gate.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quantize(value: f64) -> u64 {
    (value.max(0.0) * 1_000.0).round() as u64
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use aulos_abr::AbrOptions;
    use aulos_net::RetryPolicy;
    use tokio::sync::broadcast;

    use crate::element::{ReadyState, SourceBufferHandle};
    use crate::manifest::{SegmentIndex, SegmentInfo};
    use crate::mock::{make_period, MockSourceBuffer, ScriptedTransport};
    use crate::surface::NativeSink;
    use crate::timing::TimingsTick;

    use super::*;

    struct Rig {
        events: mpsc::Receiver<BufferEvent>,
        clock_tx: watch::Sender<TimingsTick>,
        gate_tx: watch::Sender<bool>,
        cancel: CancellationToken,
        sink_buffer: Arc<MockSourceBuffer>,
        ledger: Arc<Mutex<SegmentLedger>>,
        transport: Arc<ScriptedTransport>,
    }

    fn tick_at(time: f64) -> TimingsTick {
        TimingsTick {
            current_time: time,
            duration: 60.0,
            ready_state: ReadyState::HaveFutureData,
            playback_rate: 1.0,
            paused: false,
            stalled: false,
            buffer_gap: 0.0,
            seeking: false,
        }
    }

    fn rig_with(
        transport: Arc<ScriptedTransport>,
        period: Period,
        track: TrackType,
        config: BufferConfig,
        abr_options: AbrOptions,
    ) -> (Rig, AdaptationBuffer) {
        let adaptation = period.adaptations_of(track)[0].clone();
        let sink_buffer = Arc::new(MockSourceBuffer::new());
        let sink: Arc<dyn MediaSink> = Arc::new(NativeSink::new(sink_buffer.clone()));
        let ledger = Arc::new(Mutex::new(SegmentLedger::new()));
        let (metrics_tx, _) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let pipeline = SegmentPipeline::new(
            track,
            transport.clone(),
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                ..RetryPolicy::default()
            },
            metrics_tx,
            cancel.clone(),
        );
        let abr = Arc::new(Mutex::new(AbrCoordinator::new(abr_options)));
        let (events_tx, events_rx) = mpsc::channel(64);
        let (clock_tx, clock_rx) = watch::channel(tick_at(0.0));
        let (gate_tx, gate_rx) = watch::channel(true);

        let presentation_end = period.bounds(60.0).end;
        let buffer = AdaptationBuffer::new(BufferParams {
            track,
            period,
            adaptation,
            presentation_end,
            is_live: false,
            sink,
            ledger: ledger.clone(),
            pipeline,
            abr,
            config,
            events: events_tx,
            clock: clock_rx,
            append_gate: gate_rx,
            cancel: cancel.clone(),
        });

        (
            Rig {
                events: events_rx,
                clock_tx,
                gate_tx,
                cancel,
                sink_buffer,
                ledger,
                transport,
            },
            buffer,
        )
    }

    fn default_rig(wanted_ahead: f64) -> (Rig, AdaptationBuffer) {
        let transport = Arc::new(ScriptedTransport::vod_single_period(60.0));
        let period = make_period(
            "p1",
            0.0,
            Some(60.0),
            &[(TrackType::Video, &[1_000_000][..])],
        );
        rig_with(
            transport,
            period,
            TrackType::Video,
            BufferConfig {
                wanted_buffer_ahead: wanted_ahead,
                max_buffer_ahead: None,
                max_buffer_behind: None,
            },
            AbrOptions::default(),
        )
    }

    async fn collect_until_filled(rig: &mut Rig) -> Vec<BufferEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rig.events.recv())
                .await
                .expect("event within timeout")
                .expect("buffer alive");
            let done = matches!(event, BufferEvent::Filled { .. } | BufferEvent::Finished { .. });
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn fills_wanted_range_and_emits_filled() {
        let (mut rig, buffer) = default_rig(10.0);
        let task = tokio::spawn(buffer.run());

        let events = collect_until_filled(&mut rig).await;
        let queued = events
            .iter()
            .filter(|e| matches!(e, BufferEvent::SegmentQueued { .. }))
            .count();
        assert_eq!(queued, 5, "five 2s segments cover [0, 10)");
        assert!(matches!(
            events.last(),
            Some(BufferEvent::Filled { range, .. }) if range.end >= 10.0 - 1e-6
        ));

        // Ledger and sink agree on coverage.
        let union = rig.ledger.lock().covered_union();
        assert_eq!(union, vec![TimeRange::new(0.0, 10.0)]);
        assert_eq!(rig.sink_buffer.buffered(), vec![TimeRange::new(0.0, 10.0)]);

        rig.cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn init_segment_precedes_media() {
        let (mut rig, buffer) = default_rig(4.0);
        let task = tokio::spawn(buffer.run());
        collect_until_filled(&mut rig).await;

        // 1 init + 2 media appends.
        assert_eq!(rig.sink_buffer.append_count(), 3);

        rig.cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn filled_is_not_re_emitted_for_the_same_range() {
        let (mut rig, buffer) = default_rig(10.0);
        let task = tokio::spawn(buffer.run());
        collect_until_filled(&mut rig).await;

        // Re-send the same tick: coverage unchanged, no duplicate event.
        rig.clock_tx.send(tick_at(0.0)).unwrap();
        let extra = tokio::time::timeout(Duration::from_millis(200), rig.events.recv()).await;
        assert!(extra.is_err(), "no duplicate Filled for identical range");

        rig.cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn reaching_period_end_emits_finished() {
        let (mut rig, buffer) = default_rig(10.0);
        let task = tokio::spawn(buffer.run());
        collect_until_filled(&mut rig).await;

        rig.clock_tx.send(tick_at(52.0)).unwrap();
        let mut finished = false;
        for _ in 0..64 {
            let event = tokio::time::timeout(Duration::from_secs(5), rig.events.recv())
                .await
                .expect("event within timeout")
                .expect("buffer alive");
            if let BufferEvent::Finished { range, .. } = event {
                assert!(range.end >= 60.0 - 1e-6);
                finished = true;
                break;
            }
        }
        assert!(finished, "Finished must fire at the period end");

        rig.cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn first_selection_emits_representation_change() {
        let (mut rig, buffer) = default_rig(4.0);
        let task = tokio::spawn(buffer.run());
        let events = collect_until_filled(&mut rig).await;
        assert!(matches!(
            events.first(),
            Some(BufferEvent::RepresentationChanged { bitrate: 1_000_000, .. })
        ));
        rig.cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn exhausted_segment_is_skipped_with_warning() {
        let transport = Arc::new(ScriptedTransport::vod_single_period(60.0));
        // More failures than the retry budget of 3 retries + 1 attempt.
        transport.fail_next_segment_loads(4, true);
        let period = make_period(
            "p1",
            0.0,
            Some(60.0),
            &[(TrackType::Video, &[1_000_000][..])],
        );
        let (mut rig, buffer) = rig_with(
            transport,
            period,
            TrackType::Video,
            BufferConfig {
                wanted_buffer_ahead: 4.0,
                max_buffer_ahead: None,
                max_buffer_behind: None,
            },
            AbrOptions::default(),
        );
        let task = tokio::spawn(buffer.run());

        let events = collect_until_filled(&mut rig).await;
        assert!(
            events
                .iter()
                .any(|e| matches!(e, BufferEvent::Warning { .. })),
            "retry exhaustion surfaces a warning"
        );
        // The first 2s segment was skipped; coverage starts at 2.0.
        let union = rig.ledger.lock().covered_union();
        assert_eq!(union, vec![TimeRange::new(2.0, 4.0)]);

        rig.cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn zero_duration_segment_is_skipped() {
        let transport = Arc::new(ScriptedTransport::vod_single_period(60.0));
        let mut period = make_period(
            "p1",
            0.0,
            Some(60.0),
            &[(TrackType::Video, &[1_000_000][..])],
        );
        // Replace the index with an explicit list containing an empty segment.
        let adaptation = period.adaptations.get_mut(&TrackType::Video).unwrap();
        adaptation[0].representations[0].index = SegmentIndex::List(vec![
            SegmentInfo {
                id: "0".into(),
                time: 0.0,
                duration: 2.0,
                media_range: None,
                index_range: None,
                is_init: false,
            },
            SegmentInfo {
                id: "bad".into(),
                time: 2.0,
                duration: 0.0,
                media_range: None,
                index_range: None,
                is_init: false,
            },
            SegmentInfo {
                id: "2".into(),
                time: 2.0,
                duration: 2.0,
                media_range: None,
                index_range: None,
                is_init: false,
            },
        ]);

        let (mut rig, buffer) = rig_with(
            transport,
            period,
            TrackType::Video,
            BufferConfig {
                wanted_buffer_ahead: 4.0,
                max_buffer_ahead: None,
                max_buffer_behind: None,
            },
            AbrOptions::default(),
        );
        let task = tokio::spawn(buffer.run());

        let events = collect_until_filled(&mut rig).await;
        assert!(events.iter().any(|e| matches!(
            e,
            BufferEvent::Warning { error, .. } if error.code() == ErrorCode::BufferAppendError
        )));
        let union = rig.ledger.lock().covered_union();
        assert_eq!(union, vec![TimeRange::new(0.0, 4.0)]);

        rig.cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn quota_pressure_triggers_gc_and_retry() {
        let transport = Arc::new(ScriptedTransport::vod_single_period(60.0));
        let period = make_period(
            "p1",
            0.0,
            Some(60.0),
            &[(TrackType::Video, &[1_000_000][..])],
        );
        let (mut rig, buffer) = rig_with(
            transport,
            period,
            TrackType::Video,
            BufferConfig {
                wanted_buffer_ahead: 6.0,
                max_buffer_ahead: None,
                max_buffer_behind: Some(2.0),
            },
            AbrOptions::default(),
        );
        // Room for about three 250 kB media segments.
        rig.sink_buffer.set_quota(Some(800_000));
        let task = tokio::spawn(buffer.run());

        collect_until_filled(&mut rig).await;

        // Playhead far enough ahead that GC can reclaim the tail.
        rig.clock_tx.send(tick_at(8.0)).unwrap();
        let events = collect_until_filled(&mut rig).await;
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, BufferEvent::Warning { error, .. } if error.code() == ErrorCode::BufferFull)),
            "GC frees enough quota to proceed"
        );
        // Media behind the GC horizon was dropped.
        let union = rig.ledger.lock().covered_union();
        assert!(union.first().is_some_and(|r| r.start >= 5.9));

        rig.cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn append_gate_blocks_until_open() {
        let (mut rig, buffer) = default_rig(4.0);
        rig.gate_tx.send(false).unwrap();
        let task = tokio::spawn(buffer.run());

        // Gate closed: fetch happens, append does not.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rig.sink_buffer.append_count(), 0);

        rig.gate_tx.send(true).unwrap();
        let events = collect_until_filled(&mut rig).await;
        assert!(matches!(events.last(), Some(BufferEvent::Filled { .. })));
        assert!(rig.sink_buffer.append_count() > 0);

        rig.cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn manual_downshift_switches_representation_and_reprepends_init() {
        let transport = Arc::new(ScriptedTransport::vod_video_ladder(
            60.0,
            &[500_000, 3_000_000],
        ));
        let period = make_period(
            "p1",
            0.0,
            Some(60.0),
            &[(TrackType::Video, &[500_000, 3_000_000][..])],
        );
        let abr_options = AbrOptions {
            initial_bitrate: 3_000_000,
            min_switch_interval: Duration::ZERO,
            ..AbrOptions::default()
        };
        let (mut rig, buffer) = rig_with(
            transport,
            period,
            TrackType::Video,
            BufferConfig {
                wanted_buffer_ahead: 4.0,
                max_buffer_ahead: None,
                max_buffer_behind: None,
            },
            abr_options.clone(),
        );
        let abr = buffer.abr.clone();
        let task = tokio::spawn(buffer.run());

        let events = collect_until_filled(&mut rig).await;
        assert!(matches!(
            events.first(),
            Some(BufferEvent::RepresentationChanged { bitrate: 3_000_000, .. })
        ));
        let inits_before = rig.transport.segment_load_count();

        // Manual override forces the 500k rung on the next tick.
        abr.lock().set_manual_bitrate(Some(500_000));
        rig.clock_tx.send(tick_at(2.0)).unwrap();

        let mut saw_switch = false;
        for _ in 0..64 {
            let event = tokio::time::timeout(Duration::from_secs(5), rig.events.recv())
                .await
                .expect("event within timeout")
                .expect("buffer alive");
            if let BufferEvent::RepresentationChanged { bitrate, .. } = event {
                assert_eq!(bitrate, 500_000);
                saw_switch = true;
                break;
            }
        }
        assert!(saw_switch);
        assert!(rig.transport.segment_load_count() > inits_before);

        rig.cancel.cancel();
        let _ = task.await;
    }
}
