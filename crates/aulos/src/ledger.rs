//! Per-sink segment bookkeeping.
//!
//! The ledger records which time ranges of a sink are covered by which
//! segment, so buffers can find holes without re-parsing sink state, and
//! gaps opened by platform eviction are detected by `synchronize`.

use aulos_events::{ErrorCode, TimeRange};
use rangemap::RangeSet;
use tracing::trace;

use crate::errors::{PlayerError, PlayerResult};

/// Abutting entries merge when their content tuple matches and the seam is
/// smaller than this, in seconds.
const MERGE_EPSILON: f64 = 1e-3;

/// Resolution used for gap queries (milliseconds on the media timeline).
const GAP_SCALE: f64 = 1_000.0;

/// Identity of the content a range was filled from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerContent {
    pub period_id: String,
    pub adaptation_id: String,
    pub representation_id: String,
    pub bitrate: u64,
}

/// One covered range of the sink.
#[derive(Clone, Debug, PartialEq)]
pub struct LedgerEntry {
    pub start: f64,
    pub end: f64,
    pub segment_id: String,
    pub content: LedgerContent,
}

impl LedgerEntry {
    #[must_use]
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }
}

/// Ordered ledger of appended segments for one sink.
#[derive(Debug, Default)]
pub struct SegmentLedger {
    /// Sorted by `start`, non-overlapping.
    entries: Vec<LedgerEntry>,
}

impl SegmentLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Record an appended segment. Overlapping older entries are clipped
    /// (newest wins); abutting entries with the same content tuple merge.
    pub fn insert(
        &mut self,
        content: LedgerContent,
        segment_id: impl Into<String>,
        start: f64,
        end: f64,
    ) -> PlayerResult<()> {
        if end <= start {
            return Err(PlayerError::media(
                ErrorCode::BufferAppendError,
                format!("segment range [{start}, {end}] is empty or inverted"),
                false,
            ));
        }

        let new = LedgerEntry {
            start,
            end,
            segment_id: segment_id.into(),
            content,
        };

        // Newest wins: clip or split every older entry the new one overlaps.
        let mut retained = Vec::with_capacity(self.entries.len() + 2);
        for old in self.entries.drain(..) {
            if old.end <= new.start || old.start >= new.end {
                retained.push(old);
                continue;
            }
            if old.start < new.start {
                let mut head = old.clone();
                head.end = new.start;
                retained.push(head);
            }
            if old.end > new.end {
                let mut tail = old;
                tail.start = new.end;
                retained.push(tail);
            }
        }
        retained.push(new);
        retained.sort_by(|a, b| a.start.total_cmp(&b.start));
        self.entries = retained;
        self.coalesce();
        Ok(())
    }

    /// Merge abutting entries with an equal content tuple.
    fn coalesce(&mut self) {
        let mut out: Vec<LedgerEntry> = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            match out.last_mut() {
                Some(last)
                    if entry.content == last.content
                        && (entry.start - last.end).abs() <= MERGE_EPSILON =>
                {
                    last.end = last.end.max(entry.end);
                }
                _ => out.push(entry),
            }
        }
        self.entries = out;
    }

    /// Entry covering `time`, if any.
    #[must_use]
    pub fn get(&self, time: f64) -> Option<&LedgerEntry> {
        self.entries
            .iter()
            .find(|e| time >= e.start && time < e.end)
    }

    /// Reconcile with the sink's actual buffered ranges, pruning whatever
    /// the platform evicted behind our back.
    pub fn synchronize(&mut self, sink_ranges: &[TimeRange]) {
        let before = self.entries.len();
        let mut next = Vec::with_capacity(before);
        for entry in self.entries.drain(..) {
            for range in sink_ranges {
                let start = entry.start.max(range.start);
                let end = entry.end.min(range.end);
                if end > start {
                    let mut clipped = entry.clone();
                    clipped.start = start;
                    clipped.end = end;
                    next.push(clipped);
                }
            }
        }
        next.sort_by(|a, b| a.start.total_cmp(&b.start));
        self.entries = next;
        if self.entries.len() != before {
            trace!(
                before,
                after = self.entries.len(),
                "ledger pruned to sink ranges"
            );
        }
    }

    /// Union of covered ranges, with abutting entries merged regardless of
    /// content.
    #[must_use]
    pub fn covered_union(&self) -> Vec<TimeRange> {
        let mut out: Vec<TimeRange> = Vec::new();
        for entry in &self.entries {
            match out.last_mut() {
                Some(last) if entry.start - last.end <= MERGE_EPSILON => {
                    last.end = last.end.max(entry.end);
                }
                _ => out.push(entry.range()),
            }
        }
        out
    }

    /// Start of the first uncovered stretch inside `wanted`, if any.
    #[must_use]
    pub fn first_hole_in(&self, wanted: TimeRange) -> Option<f64> {
        if wanted.is_empty() {
            return None;
        }
        let mut covered: RangeSet<u64> = RangeSet::new();
        for entry in &self.entries {
            let start = to_ticks(entry.start.max(wanted.start));
            let end = to_ticks(entry.end.min(wanted.end));
            if end > start {
                covered.insert(start..end);
            }
        }
        let window = to_ticks(wanted.start)..to_ticks(wanted.end);
        if window.is_empty() {
            return None;
        }
        covered.gaps(&window).next().map(|gap| from_ticks(gap.start))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_ticks(seconds: f64) -> u64 {
    (seconds.max(0.0) * GAP_SCALE).round() as u64
}

#[expect(clippy::cast_precision_loss)]
fn from_ticks(ticks: u64) -> f64 {
    ticks as f64 / GAP_SCALE
}
