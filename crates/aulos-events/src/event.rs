use crate::{ErrorReport, TimeRange, TrackType};

/// Playback lifecycle event emitted to the host application.
///
/// The orchestrator merges every subsystem into one ordered stream of these.
/// `Fatal` is always the last event of a playback; `Warning` carries
/// recoverable errors the engine has already worked around.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum StreamEvent {
    /// A manifest snapshot became current for the first time.
    ManifestChange { version: u64 },
    /// A live refresh was merged into the current manifest.
    ManifestUpdate { version: u64 },
    /// The selected adaptation for a track changed (`None` = track disposed).
    AdaptationChange {
        track: TrackType,
        adaptation_id: Option<String>,
    },
    /// The selected representation (quality) for a track changed.
    RepresentationChange {
        track: TrackType,
        representation_id: String,
        bitrate: u64,
    },
    /// A buffer covered its wanted range.
    BufferFilled { track: TrackType, range: TimeRange },
    /// A buffer covered its period up to the period end.
    BufferFinished { track: TrackType, range: TimeRange },
    /// Initial buffers are ready and playback can begin.
    Loaded,
    /// Effective playback rate changed.
    Speed { rate: f64 },
    /// Playback entered or left a stall.
    Stalled { stalled: bool },
    /// Recoverable error; playback continues.
    Warning(ErrorReport),
    /// Unrecoverable error; the event stream ends after this.
    Fatal(ErrorReport),
}

impl StreamEvent {
    /// Whether this event terminates the playback event stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<ErrorReport> for StreamEvent {
    fn from(report: ErrorReport) -> Self {
        if report.fatal {
            Self::Fatal(report)
        } else {
            Self::Warning(report)
        }
    }
}
