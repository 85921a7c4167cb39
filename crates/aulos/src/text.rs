//! Overlay/text sink.
//!
//! The custom sink variant for text and image tracks: appended payloads
//! contribute time-bounded cues to an in-process ledger, and a refresh task
//! driven by a periodic tick plus seek/ended transitions keeps exactly one
//! cue attached to the host-provided render region.

use std::sync::Arc;

use async_trait::async_trait;
use aulos_events::TimeRange;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::element::SinkError;
use crate::surface::MediaSink;
use crate::pipeline::SegmentPayload;
use crate::timing::TimingsTick;

/// One renderable, time-bounded element.
#[derive(Clone, Debug, PartialEq)]
pub struct Cue {
    pub start: f64,
    pub end: f64,
    pub payload: String,
}

impl Cue {
    #[must_use]
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }
}

/// Host-side render region for the overlay sink.
pub trait OverlayRenderer: Send + Sync {
    fn attach(&self, cue: &Cue);
    fn remove(&self, cue: &Cue);
}

/// Renderer that draws nowhere. Used when a text track is buffered but the
/// host supplied no region.
pub struct NullRenderer;

impl OverlayRenderer for NullRenderer {
    fn attach(&self, _cue: &Cue) {}
    fn remove(&self, _cue: &Cue) {}
}

/// Custom sink maintaining the cue ledger and the attached element.
pub struct TextSink {
    renderer: Arc<dyn OverlayRenderer>,
    /// Sorted by start.
    cues: Mutex<Vec<Cue>>,
    attached: Mutex<Option<Cue>>,
    aborted: Mutex<bool>,
    /// Refresh cadence in milliseconds; the selection epsilon derives from it.
    refresh_interval_ms: u64,
}

impl TextSink {
    #[must_use]
    pub fn new(renderer: Arc<dyn OverlayRenderer>, refresh_interval_ms: u64) -> Self {
        Self {
            renderer,
            cues: Mutex::new(Vec::new()),
            attached: Mutex::new(None),
            aborted: Mutex::new(false),
            refresh_interval_ms: refresh_interval_ms.max(1),
        }
    }

    /// Selection epsilon in seconds, spreading the sampling error across
    /// sub-intervals of the refresh cadence.
    #[must_use]
    fn epsilon(&self) -> f64 {
        #[expect(clippy::cast_precision_loss)]
        let interval = self.refresh_interval_ms as f64;
        interval / 3000.0
    }

    /// Re-evaluate which cue should be visible at `current_time`.
    ///
    /// The previous cue is removed before the next one is attached; equal
    /// cues are a no-op.
    pub fn refresh(&self, current_time: f64) {
        if *self.aborted.lock() {
            return;
        }
        let lookup = current_time - self.epsilon();
        let next = self
            .cues
            .lock()
            .iter()
            .find(|c| lookup >= c.start && lookup < c.end)
            .cloned();

        let mut attached = self.attached.lock();
        if *attached == next {
            return;
        }
        if let Some(previous) = attached.take() {
            self.renderer.remove(&previous);
        }
        if let Some(cue) = next {
            trace!(start = cue.start, end = cue.end, "overlay cue attached");
            self.renderer.attach(&cue);
            *attached = Some(cue);
        }
    }

    /// Spawn the refresh task combining a periodic tick with clock-driven
    /// (seek, ended) updates.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        mut clock: watch::Receiver<TimingsTick>,
        cancel: CancellationToken,
    ) {
        let sink = Arc::clone(self);
        tokio::spawn(async move {
            let period = std::time::Duration::from_millis(sink.refresh_interval_ms);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let time = clock.borrow().current_time;
                        sink.refresh(time);
                    }
                    changed = clock.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let tick = clock.borrow().clone();
                        if tick.seeking {
                            sink.refresh(tick.current_time);
                        }
                    }
                }
            }
        });
    }

    #[must_use]
    pub fn attached_cue(&self) -> Option<Cue> {
        self.attached.lock().clone()
    }

    #[must_use]
    pub fn cue_count(&self) -> usize {
        self.cues.lock().len()
    }
}

#[async_trait]
impl MediaSink for TextSink {
    async fn append(&self, payload: SegmentPayload) -> Result<(), SinkError> {
        if *self.aborted.lock() {
            return Err(SinkError::Aborted);
        }
        let mut cues = self.cues.lock();
        for cue in payload.cues {
            if !cues.contains(&cue) {
                cues.push(cue);
            }
        }
        cues.sort_by(|a, b| a.start.total_cmp(&b.start));
        Ok(())
    }

    async fn remove(&self, range: TimeRange) -> Result<(), SinkError> {
        self.cues.lock().retain(|c| !c.range().overlaps(&range));
        Ok(())
    }

    fn abort(&self) {
        *self.aborted.lock() = true;
        if let Some(previous) = self.attached.lock().take() {
            self.renderer.remove(&previous);
        }
    }

    fn buffered(&self) -> Vec<TimeRange> {
        let cues = self.cues.lock();
        let mut out: Vec<TimeRange> = Vec::new();
        for cue in cues.iter() {
            match out.last_mut() {
                Some(last) if cue.start <= last.end => {
                    last.end = last.end.max(cue.end);
                }
                _ => out.push(cue.range()),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use parking_lot::Mutex as PlMutex;

    use super::*;

    #[derive(Default)]
    struct RecordingRenderer {
        log: PlMutex<Vec<String>>,
    }

    impl OverlayRenderer for RecordingRenderer {
        fn attach(&self, cue: &Cue) {
            self.log.lock().push(format!("attach:{}", cue.payload));
        }

        fn remove(&self, cue: &Cue) {
            self.log.lock().push(format!("remove:{}", cue.payload));
        }
    }

    fn cue(start: f64, end: f64, payload: &str) -> Cue {
        Cue {
            start,
            end,
            payload: payload.into(),
        }
    }

    fn payload(cues: Vec<Cue>) -> SegmentPayload {
        let range = TimeRange::new(
            cues.first().map_or(0.0, |c| c.start),
            cues.last().map_or(0.0, |c| c.end),
        );
        SegmentPayload {
            data: Bytes::new(),
            range,
            cues,
        }
    }

    #[tokio::test]
    async fn refresh_attaches_the_covering_cue() {
        let renderer = Arc::new(RecordingRenderer::default());
        let sink = TextSink::new(renderer.clone(), 200);
        sink.append(payload(vec![cue(0.0, 2.0, "a"), cue(2.0, 4.0, "b")]))
            .await
            .unwrap();

        sink.refresh(1.0);
        assert_eq!(sink.attached_cue().unwrap().payload, "a");

        // Switching removes the previous element first.
        sink.refresh(3.0);
        assert_eq!(
            renderer.log.lock().as_slice(),
            ["attach:a", "remove:a", "attach:b"]
        );
    }

    #[tokio::test]
    async fn equal_cue_is_a_no_op() {
        let renderer = Arc::new(RecordingRenderer::default());
        let sink = TextSink::new(renderer.clone(), 200);
        sink.append(payload(vec![cue(0.0, 5.0, "a")])).await.unwrap();

        sink.refresh(1.0);
        sink.refresh(2.0);
        sink.refresh(3.0);
        assert_eq!(renderer.log.lock().len(), 1, "one attach, no churn");
    }

    #[tokio::test]
    async fn gap_detaches_without_replacement() {
        let renderer = Arc::new(RecordingRenderer::default());
        let sink = TextSink::new(renderer.clone(), 200);
        sink.append(payload(vec![cue(0.0, 2.0, "a")])).await.unwrap();

        sink.refresh(1.0);
        sink.refresh(10.0);
        assert!(sink.attached_cue().is_none());
        assert_eq!(renderer.log.lock().as_slice(), ["attach:a", "remove:a"]);
    }

    #[tokio::test]
    async fn abort_removes_the_attached_cue_and_blocks_appends() {
        let renderer = Arc::new(RecordingRenderer::default());
        let sink = TextSink::new(renderer.clone(), 200);
        sink.append(payload(vec![cue(0.0, 2.0, "a")])).await.unwrap();
        sink.refresh(1.0);

        sink.abort();
        assert!(sink.attached_cue().is_none());
        assert!(renderer.log.lock().contains(&"remove:a".to_string()));

        let result = sink.append(payload(vec![cue(2.0, 4.0, "b")])).await;
        assert_eq!(result, Err(SinkError::Aborted));
    }

    #[tokio::test]
    async fn buffered_merges_contiguous_cues() {
        let sink = TextSink::new(Arc::new(NullRenderer), 200);
        sink.append(payload(vec![
            cue(0.0, 2.0, "a"),
            cue(2.0, 4.0, "b"),
            cue(8.0, 9.0, "c"),
        ]))
        .await
        .unwrap();
        assert_eq!(
            sink.buffered(),
            vec![TimeRange::new(0.0, 4.0), TimeRange::new(8.0, 9.0)]
        );
    }

    #[tokio::test]
    async fn selection_uses_epsilon_lookbehind() {
        let sink = TextSink::new(Arc::new(NullRenderer), 300);
        sink.append(payload(vec![cue(0.0, 2.0, "a")])).await.unwrap();

        // epsilon = 300 / 3000 = 0.1 s: at exactly 2.05 the lookup time
        // (1.95) still falls inside the cue.
        sink.refresh(2.05);
        assert_eq!(sink.attached_cue().unwrap().payload, "a");

        sink.refresh(2.2);
        assert!(sink.attached_cue().is_none());
    }

    #[tokio::test]
    async fn duplicate_cues_are_deduplicated() {
        let sink = TextSink::new(Arc::new(NullRenderer), 200);
        sink.append(payload(vec![cue(0.0, 2.0, "a")])).await.unwrap();
        sink.append(payload(vec![cue(0.0, 2.0, "a")])).await.unwrap();
        assert_eq!(sink.cue_count(), 1);
    }
}
