use std::fmt;

/// Kind of media track handled by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackType {
    Audio,
    Video,
    Text,
    Image,
}

impl TrackType {
    /// Track types fed through a platform-native sink.
    pub const NATIVE: [Self; 2] = [Self::Audio, Self::Video];

    /// Whether this track type is appended to a native (source-extension
    /// backed) sink rather than an in-process custom sink.
    #[must_use]
    pub fn is_native(self) -> bool {
        matches!(self, Self::Audio | Self::Video)
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Text => "text",
            Self::Image => "image",
        };
        f.write_str(name)
    }
}

/// Half-open interval `[start, end)` on the media timeline, in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    #[must_use]
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[must_use]
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }

    /// Intersection with another range. Empty result collapses onto `start`.
    #[must_use]
    pub fn clip(&self, bounds: &Self) -> Self {
        let start = self.start.max(bounds.start);
        let end = self.end.min(bounds.end).max(start);
        Self { start, end }
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}
