//! Manifest data model.
//!
//! A [`Manifest`] is an immutable-per-fetch snapshot of ordered periods.
//! Live refreshes merge a newer snapshot into the current one with
//! [`Manifest::update`], which preserves period identity (`Period::id` is
//! stable across refreshes) and bumps a version counter only when the merge
//! actually changed something.

use std::collections::HashMap;

use aulos_abr::Candidate;
use aulos_events::{TimeRange, TrackType};
use tracing::debug;
use url::Url;

/// Finite stand-in for an unbounded presentation duration.
///
/// An infinite duration is persisted as this value so nothing downstream
/// ever compares against `f64::INFINITY`.
pub const MAX_SOURCE_DURATION: f64 = f64::MAX;

/// Segment descriptor. Bytes flow separately through the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentInfo {
    pub id: String,
    /// Presentation time of the first sample, seconds.
    pub time: f64,
    pub duration: f64,
    /// Byte range into the media resource, when ranged requests apply.
    pub media_range: Option<(u64, Option<u64>)>,
    /// Byte range of the segment index, for indexed containers.
    pub index_range: Option<(u64, u64)>,
    pub is_init: bool,
}

impl SegmentInfo {
    #[must_use]
    pub fn end(&self) -> f64 {
        self.time + self.duration
    }

    #[must_use]
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.time, self.end())
    }
}

/// Maps wanted time ranges to segment descriptors.
#[derive(Clone, Debug, PartialEq)]
pub enum SegmentIndex {
    /// Uniform segmentation: `count` segments of `segment_duration` starting
    /// at `start`. `None` count means unbounded (live).
    Template {
        start: f64,
        segment_duration: f64,
        count: Option<u64>,
    },
    /// Explicit segment list.
    List(Vec<SegmentInfo>),
}

impl SegmentIndex {
    /// Media segments overlapping `range`, in timeline order.
    #[must_use]
    pub fn segments_in(&self, range: TimeRange) -> Vec<SegmentInfo> {
        if range.is_empty() {
            return Vec::new();
        }
        match self {
            Self::Template {
                start,
                segment_duration,
                count,
            } => {
                if *segment_duration <= 0.0 {
                    return Vec::new();
                }
                let mut out = Vec::new();
                #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let mut k = (((range.start - start) / segment_duration).floor().max(0.0)) as u64;
                loop {
                    if count.is_some_and(|count| k >= count) {
                        break;
                    }
                    #[expect(clippy::cast_precision_loss)]
                    let time = start + (k as f64) * segment_duration;
                    if time >= range.end {
                        break;
                    }
                    out.push(SegmentInfo {
                        id: k.to_string(),
                        time,
                        duration: *segment_duration,
                        media_range: None,
                        index_range: None,
                        is_init: false,
                    });
                    k += 1;
                }
                out
            }
            Self::List(segments) => segments
                .iter()
                .filter(|s| {
                    // Degenerate entries are surfaced as points so callers
                    // can reject them instead of silently looping past.
                    let degenerate = s.duration <= 0.0 && range.contains(s.time);
                    !s.is_init && (s.range().overlaps(&range) || degenerate)
                })
                .cloned()
                .collect(),
        }
    }

    /// End of the last indexed segment, when known.
    #[must_use]
    pub fn last_position(&self) -> Option<f64> {
        match self {
            Self::Template {
                start,
                segment_duration,
                count,
            } => count.map(|count| {
                #[expect(clippy::cast_precision_loss)]
                let count = count as f64;
                start + count * segment_duration
            }),
            Self::List(segments) => segments
                .iter()
                .filter(|s| !s.is_init)
                .map(SegmentInfo::end)
                .fold(None, |acc: Option<f64>, end| {
                    Some(acc.map_or(end, |a| a.max(end)))
                }),
        }
    }
}

/// A concrete encoding within an adaptation.
#[derive(Clone, Debug, PartialEq)]
pub struct Representation {
    pub id: String,
    pub bitrate: u64,
    pub mime_type: String,
    pub codecs: String,
    pub width: Option<u32>,
    pub init_segment: Option<SegmentInfo>,
    pub index: SegmentIndex,
}

impl Representation {
    /// Full content type for native sink creation.
    #[must_use]
    pub fn sink_type(&self) -> String {
        format!("{}; codecs=\"{}\"", self.mime_type, self.codecs)
    }

    #[must_use]
    pub fn candidate(&self, index: usize) -> Candidate {
        Candidate {
            index,
            bitrate: self.bitrate,
            width: self.width,
        }
    }
}

/// A selectable variant group (language, role) for one track type.
#[derive(Clone, Debug, PartialEq)]
pub struct Adaptation {
    pub id: String,
    pub track_type: TrackType,
    pub language: Option<String>,
    /// Never empty.
    pub representations: Vec<Representation>,
}

impl Adaptation {
    #[must_use]
    pub fn candidates(&self) -> Vec<Candidate> {
        self.representations
            .iter()
            .enumerate()
            .map(|(i, r)| r.candidate(i))
            .collect()
    }
}

/// A contiguous interval of the presentation with a fixed adaptation set.
#[derive(Clone, Debug, PartialEq)]
pub struct Period {
    pub id: String,
    pub start: f64,
    pub duration: Option<f64>,
    pub adaptations: HashMap<TrackType, Vec<Adaptation>>,
}

impl Period {
    #[must_use]
    pub fn end(&self) -> Option<f64> {
        self.duration.map(|d| self.start + d)
    }

    /// Period bounds, falling back to the presentation end for open periods.
    #[must_use]
    pub fn bounds(&self, presentation_end: f64) -> TimeRange {
        TimeRange::new(self.start, self.end().unwrap_or(presentation_end))
    }

    #[must_use]
    pub fn contains(&self, time: f64, presentation_end: f64) -> bool {
        self.bounds(presentation_end).contains(time)
    }

    #[must_use]
    pub fn adaptations_of(&self, track: TrackType) -> &[Adaptation] {
        self.adaptations.get(&track).map_or(&[], Vec::as_slice)
    }

    /// Track types present in this period, native first for deterministic
    /// sink creation order.
    #[must_use]
    pub fn track_types(&self) -> Vec<TrackType> {
        let mut types: Vec<TrackType> = self.adaptations.keys().copied().collect();
        types.sort_by_key(|t| (!t.is_native(), format!("{t}")));
        types
    }
}

/// Per-fetch manifest snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    periods: Vec<Period>,
    pub is_live: bool,
    duration: f64,
    url: Option<Url>,
    version: u64,
}

impl Manifest {
    /// Build a snapshot. Periods are sorted by start; an infinite or missing
    /// duration is replaced by [`MAX_SOURCE_DURATION`].
    #[must_use]
    pub fn new(mut periods: Vec<Period>, is_live: bool, duration: Option<f64>, url: Option<Url>) -> Self {
        periods.sort_by(|a, b| a.start.total_cmp(&b.start));
        let duration = match duration {
            Some(d) if d.is_finite() => d,
            _ => MAX_SOURCE_DURATION,
        };
        Self {
            periods,
            is_live,
            duration,
            url,
            version: 0,
        }
    }

    /// Presentation duration. Always finite.
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.duration
    }

    #[must_use]
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn periods(&self) -> &[Period] {
        &self.periods
    }

    #[must_use]
    pub fn period_for_time(&self, time: f64) -> Option<&Period> {
        self.periods
            .iter()
            .find(|p| p.contains(time, self.duration))
    }

    #[must_use]
    pub fn first_period(&self) -> Option<&Period> {
        self.periods.first()
    }

    /// Merge a refreshed snapshot into this one.
    ///
    /// Periods are matched by id: matched ones take the refreshed contents
    /// in place, unmatched refreshed periods are appended, and periods the
    /// refresh no longer lists are kept. Idempotent: re-applying the same
    /// refresh changes nothing and does not bump the version.
    pub fn update(&mut self, refreshed: Manifest) -> bool {
        let mut changed = false;

        for period in refreshed.periods {
            if let Some(existing) = self.periods.iter_mut().find(|p| p.id == period.id) {
                if *existing != period {
                    *existing = period;
                    changed = true;
                }
            } else {
                debug!(period_id = %period.id, "manifest refresh introduced a period");
                self.periods.push(period);
                changed = true;
            }
        }
        self.periods.sort_by(|a, b| a.start.total_cmp(&b.start));

        if self.duration != refreshed.duration {
            self.duration = refreshed.duration;
            changed = true;
        }
        if self.is_live != refreshed.is_live {
            self.is_live = refreshed.is_live;
            changed = true;
        }
        if changed {
            self.version += 1;
        }
        changed
    }
}
