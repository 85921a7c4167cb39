//! Presentation element seam.
//!
//! The engine never talks to a concrete platform; the host implements
//! [`MediaElement`] (and through it the source-extension handles) over
//! whatever actually renders. [`crate::mock`] provides the scripted
//! implementation used by the test-suite.

use std::sync::Arc;

use async_trait::async_trait;
use aulos_events::TimeRange;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::errors::PlayerResult;

/// Element readiness, ordered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    #[default]
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
    HaveFutureData,
    HaveEnoughData,
}

/// Source extension lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SourceReadyState {
    #[default]
    Closed,
    Open,
    Ended,
}

/// Events the engine consumes from the presentation element.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ElementEvent {
    Encrypted {
        init_data_type: String,
        init_data: Bytes,
    },
    Seeking,
    Seeked,
    Ended,
    LoadedMetadata,
    CanPlay,
    Waiting,
    Stalled,
}

/// Sink-level failures, kept separate from the engine catalog so append
/// paths can react to quota pressure specifically.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink quota exceeded")]
    QuotaExceeded,
    #[error("sink aborted")]
    Aborted,
    #[error("append rejected: {0}")]
    Append(String),
}

/// One native append target created through the source extension.
#[async_trait]
pub trait SourceBufferHandle: Send + Sync {
    async fn append(&self, data: Bytes) -> Result<(), SinkError>;

    /// Drop buffered media inside `range`.
    async fn remove(&self, range: TimeRange) -> Result<(), SinkError>;

    /// Abort the in-flight operation, if any.
    fn abort(&self);

    fn buffered(&self) -> Vec<TimeRange>;
}

/// The source-extension surface of an attached element.
#[async_trait]
pub trait MediaSourceHandle: Send + Sync {
    fn ready_state(&self) -> SourceReadyState;

    /// Resolve once the source reaches `Open`.
    async fn wait_open(&self) -> PlayerResult<()>;

    fn set_duration(&self, duration: f64);

    fn duration(&self) -> f64;

    fn add_source_buffer(&self, sink_type: &str) -> PlayerResult<Arc<dyn SourceBufferHandle>>;

    fn remove_source_buffer(&self, sink_type: &str);

    fn end_of_stream(&self);
}

/// Platform presentation element.
#[async_trait]
pub trait MediaElement: Send + Sync + 'static {
    fn set_src(&self, src: Option<String>);

    fn src(&self) -> Option<String>;

    fn current_time(&self) -> f64;

    fn seek(&self, time: f64);

    fn duration(&self) -> f64;

    fn playback_rate(&self) -> f64;

    fn set_playback_rate(&self, rate: f64);

    fn paused(&self) -> bool;

    async fn play(&self) -> PlayerResult<()>;

    fn pause(&self);

    fn ready_state(&self) -> ReadyState;

    /// Union of buffered ranges across the element's sinks.
    fn buffered(&self) -> Vec<TimeRange>;

    fn events(&self) -> broadcast::Receiver<ElementEvent>;

    /// Create a source extension and return it with its attachment URL.
    /// The caller assigns the URL to `src` and must later revoke it.
    fn open_media_source(&self) -> PlayerResult<(Arc<dyn MediaSourceHandle>, String)>;

    /// Release an attachment URL produced by [`Self::open_media_source`].
    fn revoke_attachment(&self, attachment: &str);
}

/// Buffered range containing `time`, if any.
#[must_use]
pub fn buffered_range_at(ranges: &[TimeRange], time: f64) -> Option<TimeRange> {
    ranges.iter().find(|r| r.contains(time)).copied()
}

/// Seconds of contiguous media ahead of `time`, 0 when `time` sits in a gap.
#[must_use]
pub fn buffer_gap_at(ranges: &[TimeRange], time: f64) -> f64 {
    buffered_range_at(ranges, time).map_or(0.0, |r| r.end - time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_states_are_ordered() {
        assert!(ReadyState::HaveNothing < ReadyState::HaveMetadata);
        assert!(ReadyState::HaveMetadata < ReadyState::HaveEnoughData);
    }

    #[test]
    fn buffer_gap_inside_and_outside_ranges() {
        let ranges = vec![TimeRange::new(0.0, 10.0), TimeRange::new(20.0, 30.0)];
        assert_eq!(buffer_gap_at(&ranges, 4.0), 6.0);
        assert_eq!(buffer_gap_at(&ranges, 15.0), 0.0);
        assert_eq!(buffer_gap_at(&ranges, 20.0), 10.0);
    }
}
