use web_time::Instant;

use crate::{AbrOptions, Candidate, Estimator, ThroughputEstimator, ThroughputSample};

/// Why a selection came out the way it did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SelectionReason {
    Initial,
    Manual,
    UpSwitch,
    DownSwitch,
    Debounced,
    NoEstimate,
    BufferTooLowForUpSwitch,
    AlreadyOptimal,
}

/// Outcome of one selection round.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Selection {
    pub index: usize,
    pub bitrate: u64,
    pub reason: SelectionReason,
    /// True only when the decision differs from the previously applied one.
    pub changed: bool,
}

/// Per-track adaptive bitrate coordinator.
///
/// `select()` both decides and applies: a changed outcome becomes the new
/// current representation and starts the debounce window. Runtime
/// constraints (`set_throttle`, `set_width_limit`, `set_manual_bitrate`)
/// clip the candidate set of subsequent rounds.
pub struct AbrCoordinator<E: Estimator = ThroughputEstimator> {
    opts: AbrOptions,
    estimator: E,
    current: Option<(usize, u64)>,
    last_switch_at: Option<Instant>,
    manual_bitrate: Option<u64>,
    throttle_bps: Option<u64>,
    width_limit: Option<u32>,
}

impl AbrCoordinator<ThroughputEstimator> {
    #[must_use]
    pub fn new(opts: AbrOptions) -> Self {
        let estimator = ThroughputEstimator::new(opts.initial_bitrate);
        Self::with_estimator(opts, estimator)
    }
}

impl<E: Estimator> AbrCoordinator<E> {
    pub fn with_estimator(opts: AbrOptions, estimator: E) -> Self {
        let manual_bitrate = opts.manual_bitrate;
        Self {
            opts,
            estimator,
            current: None,
            last_switch_at: None,
            manual_bitrate,
            throttle_bps: None,
            width_limit: None,
        }
    }

    pub fn push_sample(&mut self, sample: ThroughputSample) {
        self.estimator.push_sample(sample);
    }

    pub fn buffer_level_secs(&self) -> f64 {
        self.estimator.buffer_level_secs()
    }

    /// Forget buffer health, e.g. after a seek.
    pub fn reset_buffer(&mut self) {
        self.estimator.reset_buffer();
    }

    pub fn set_manual_bitrate(&mut self, bitrate: Option<u64>) {
        self.manual_bitrate = bitrate;
    }

    pub fn set_throttle(&mut self, bps: Option<u64>) {
        self.throttle_bps = bps;
    }

    pub fn set_width_limit(&mut self, width: Option<u32>) {
        self.width_limit = width;
    }

    #[must_use]
    pub fn current_index(&self) -> Option<usize> {
        self.current.map(|(index, _)| index)
    }

    /// Decide the representation to use next among `candidates`.
    ///
    /// Returns `None` only for an empty candidate list.
    pub fn select(&mut self, candidates: &[Candidate], now: Instant) -> Option<Selection> {
        if candidates.is_empty() {
            return None;
        }

        let mut pool: Vec<Candidate> = candidates.to_vec();
        pool.sort_by_key(|c| c.bitrate);
        self.clip_width(&mut pool);

        if let Some(manual) = self.manual_bitrate {
            let pick = closest_at_or_below(&pool, manual)?;
            return Some(self.settle(pick, SelectionReason::Manual, now));
        }

        self.clip_bitrate(&mut pool, self.opts.max_auto_bitrate);
        self.clip_bitrate(&mut pool, self.throttle_bps);

        let Some((current_index, current_bitrate)) = self.current else {
            let floor = pool.first().map_or(0, |c| c.bitrate);
            let pick = closest_at_or_below(&pool, self.opts.initial_bitrate.max(floor))?;
            return Some(self.settle(pick, SelectionReason::Initial, now));
        };

        if !self.can_switch_now(now) {
            tracing::debug!(current_index, "abr: debounce window active");
            return Some(self.hold(SelectionReason::Debounced));
        }

        let Some(estimate_bps) = self.estimator.estimate_bps() else {
            return Some(self.hold(SelectionReason::NoEstimate));
        };

        #[expect(clippy::cast_precision_loss)] // bitrate precision loss is irrelevant here
        let spendable_bps = (estimate_bps as f64 / self.opts.safety_factor).max(0.0);
        let buffer_level_secs = self.estimator.buffer_level_secs();

        let candidate = pool
            .iter()
            .filter(|c| {
                #[expect(clippy::cast_precision_loss)]
                let fits = (c.bitrate as f64) <= spendable_bps;
                fits
            })
            .max_by_key(|c| c.bitrate)
            .or_else(|| pool.first())
            .copied()?;

        tracing::debug!(
            current_bitrate,
            estimate_bps,
            spendable_bps,
            buffer_level_secs,
            candidate_bitrate = candidate.bitrate,
            "abr: evaluating"
        );

        if candidate.bitrate > current_bitrate {
            let buffer_ok = self.opts.min_buffer_for_up_switch_secs <= 0.0
                || buffer_level_secs >= self.opts.min_buffer_for_up_switch_secs;
            #[expect(clippy::cast_precision_loss)]
            let headroom_ok =
                spendable_bps >= (candidate.bitrate as f64) * self.opts.up_hysteresis_ratio;
            if buffer_ok && headroom_ok {
                return Some(self.settle(candidate, SelectionReason::UpSwitch, now));
            }
            return Some(self.hold(SelectionReason::BufferTooLowForUpSwitch));
        }

        if candidate.bitrate < current_bitrate {
            let urgent = buffer_level_secs <= self.opts.down_switch_buffer_secs;
            #[expect(clippy::cast_precision_loss)]
            let margin_ok =
                spendable_bps <= (current_bitrate as f64) * self.opts.down_hysteresis_ratio;
            if urgent || margin_ok {
                return Some(self.settle(candidate, SelectionReason::DownSwitch, now));
            }
        }

        Some(self.hold(SelectionReason::AlreadyOptimal))
    }

    fn hold(&self, reason: SelectionReason) -> Selection {
        let (index, bitrate) = self.current.unwrap_or((0, 0));
        Selection {
            index,
            bitrate,
            reason,
            changed: false,
        }
    }

    fn settle(&mut self, pick: Candidate, reason: SelectionReason, now: Instant) -> Selection {
        let changed = self.current != Some((pick.index, pick.bitrate));
        if changed {
            self.current = Some((pick.index, pick.bitrate));
            self.last_switch_at = Some(now);
        }
        Selection {
            index: pick.index,
            bitrate: pick.bitrate,
            reason,
            changed,
        }
    }

    fn can_switch_now(&self, now: Instant) -> bool {
        self.last_switch_at
            .is_none_or(|t| now.duration_since(t) >= self.opts.min_switch_interval)
    }

    /// Keep candidates fitting the display; fall back to the narrowest when
    /// nothing fits.
    fn clip_width(&self, pool: &mut Vec<Candidate>) {
        let Some(limit) = self.width_limit else {
            return;
        };
        if pool.iter().any(|c| c.width.is_some_and(|w| w <= limit)) {
            pool.retain(|c| c.width.is_none_or(|w| w <= limit));
        } else if let Some(narrowest) = pool
            .iter()
            .filter(|c| c.width.is_some())
            .min_by_key(|c| c.width)
            .copied()
        {
            pool.retain(|c| c.width.is_none() || *c == narrowest);
        }
    }

    /// Drop candidates above `ceiling`, keeping at least the lowest bitrate.
    fn clip_bitrate(&self, pool: &mut Vec<Candidate>, ceiling: Option<u64>) {
        let Some(ceiling) = ceiling else {
            return;
        };
        if pool.iter().any(|c| c.bitrate <= ceiling) {
            pool.retain(|c| c.bitrate <= ceiling);
        } else if let Some(lowest) = pool.iter().min_by_key(|c| c.bitrate).copied() {
            pool.retain(|c| *c == lowest);
        }
    }
}

/// Exact bitrate match, else the closest candidate at or below, else the
/// lowest available. `pool` must be sorted by bitrate.
fn closest_at_or_below(pool: &[Candidate], bitrate: u64) -> Option<Candidate> {
    pool.iter()
        .rev()
        .find(|c| c.bitrate <= bitrate)
        .or_else(|| pool.first())
        .copied()
}
