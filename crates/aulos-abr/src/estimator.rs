#[cfg(test)]
use mockall::automock;

use crate::ThroughputSample;

/// Throughput estimation strategy.
///
/// Abstracted so [`crate::AbrCoordinator`] can be tested with scripted
/// estimates.
#[cfg_attr(test, automock)]
pub trait Estimator: Send {
    /// Current throughput estimate in bits per second, if any.
    fn estimate_bps(&self) -> Option<u64>;

    /// Feed one observed download.
    fn push_sample(&mut self, sample: ThroughputSample);

    /// Buffered content ahead of playback, in seconds.
    fn buffer_level_secs(&self) -> f64;

    /// Forget accumulated buffer level (seek, period change).
    fn reset_buffer(&mut self);
}

/// Dual-window EWMA throughput estimator.
///
/// Tracks a fast and a slow moving average and reports the minimum of the
/// two, so sudden drops register quickly while single fast downloads do not
/// inflate the estimate.
#[derive(Clone, Debug)]
pub struct ThroughputEstimator {
    fast: Ewma,
    slow: Ewma,
    initial_bps: f64,
    buffered_content_secs: f64,
}

impl ThroughputEstimator {
    const FAST_HALF_LIFE_SECS: f64 = 2.0;
    const SLOW_HALF_LIFE_SECS: f64 = 10.0;
    /// Samples smaller than this carry too much per-request overhead.
    const MIN_SAMPLE_BYTES: u64 = 16_000;
    const MIN_DURATION_MS: f64 = 0.5;

    #[must_use]
    pub fn new(initial_bitrate: u64) -> Self {
        #[expect(clippy::cast_precision_loss)] // bitrate precision loss is irrelevant here
        let initial_bps = initial_bitrate as f64;
        Self {
            fast: Ewma::new(Self::FAST_HALF_LIFE_SECS),
            slow: Ewma::new(Self::SLOW_HALF_LIFE_SECS),
            initial_bps,
            buffered_content_secs: 0.0,
        }
    }
}

impl Estimator for ThroughputEstimator {
    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    // rounded non-negative estimates always fit u64
    fn estimate_bps(&self) -> Option<u64> {
        let est = self.fast.estimate().min(self.slow.estimate());
        if est > 0.0 {
            Some(est.round() as u64)
        } else if self.initial_bps > 0.0 {
            Some(self.initial_bps.round() as u64)
        } else {
            None
        }
    }

    fn push_sample(&mut self, sample: ThroughputSample) {
        if let Some(content) = sample.content_duration {
            self.buffered_content_secs += content.as_secs_f64();
        }

        if sample.bytes < Self::MIN_SAMPLE_BYTES {
            return;
        }

        let dur_ms = (sample.duration.as_secs_f64() * 1000.0).max(Self::MIN_DURATION_MS);
        #[expect(clippy::cast_precision_loss)] // byte counts fit f64 mantissa in practice
        let bps = (sample.bytes as f64) * 8000.0 / dur_ms;
        let weight_secs = dur_ms / 1000.0;

        self.fast.add(weight_secs, bps);
        self.slow.add(weight_secs, bps);
    }

    fn buffer_level_secs(&self) -> f64 {
        self.buffered_content_secs
    }

    fn reset_buffer(&mut self) {
        self.buffered_content_secs = 0.0;
    }
}

/// Exponentially weighted moving average with zero-bias correction.
#[derive(Clone, Debug)]
struct Ewma {
    alpha: f64,
    last: f64,
    total_weight: f64,
}

impl Ewma {
    fn new(half_life_secs: f64) -> Self {
        Self {
            alpha: f64::exp(0.5_f64.ln() / half_life_secs.max(0.001)),
            last: 0.0,
            total_weight: 0.0,
        }
    }

    fn add(&mut self, weight: f64, value: f64) {
        let adj_alpha = self.alpha.powf(weight.max(0.0));
        self.last = value * (1.0 - adj_alpha) + adj_alpha * self.last;
        self.total_weight += weight.max(0.0);
    }

    fn estimate(&self) -> f64 {
        if self.total_weight <= 0.0 {
            0.0
        } else {
            let zero_factor = 1.0 - self.alpha.powf(self.total_weight);
            self.last / zero_factor.max(1e-6)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use web_time::Instant;

    use super::*;

    fn sample(bytes: u64, millis: u64, content_secs: Option<f64>) -> ThroughputSample {
        ThroughputSample {
            bytes,
            duration: Duration::from_millis(millis),
            at: Instant::now(),
            content_duration: content_secs.map(Duration::from_secs_f64),
        }
    }

    #[test]
    fn no_estimate_without_samples_or_initial() {
        let est = ThroughputEstimator::new(0);
        assert_eq!(est.estimate_bps(), None);
    }

    #[test]
    fn initial_bitrate_seeds_estimate() {
        let est = ThroughputEstimator::new(700_000);
        assert_eq!(est.estimate_bps(), Some(700_000));
    }

    #[rstest]
    #[case(vec![(500_000, 1000)], 3_500_000)]
    #[case(vec![(500_000, 1000), (500_000, 1000)], 3_800_000)]
    #[case(vec![(1_000_000, 1000), (1_000_000, 1000), (1_000_000, 1000)], 7_500_000)]
    fn stable_downloads_estimate_at_least(
        #[case] samples: Vec<(u64, u64)>,
        #[case] expected_min_bps: u64,
    ) {
        let mut est = ThroughputEstimator::new(0);
        for (bytes, ms) in samples {
            est.push_sample(sample(bytes, ms, None));
        }
        let bps = est.estimate_bps().expect("estimate after network samples");
        assert!(bps >= expected_min_bps, "estimate {bps} < {expected_min_bps}");
    }

    #[test]
    fn small_samples_are_ignored() {
        let mut est = ThroughputEstimator::new(0);
        est.push_sample(sample(10_000, 100, None));
        assert_eq!(est.estimate_bps(), None);

        est.push_sample(sample(100_000, 1000, None));
        assert!(est.estimate_bps().is_some());
    }

    #[test]
    fn tiny_durations_are_clamped() {
        let mut est = ThroughputEstimator::new(0);
        est.push_sample(ThroughputSample {
            bytes: 100_000,
            duration: Duration::from_nanos(1),
            at: Instant::now(),
            content_duration: None,
        });
        assert!(est.estimate_bps().expect("estimate") > 1_000_000);
    }

    #[test]
    fn buffer_level_accumulates_and_resets() {
        let mut est = ThroughputEstimator::new(0);
        est.push_sample(sample(100_000, 500, Some(2.0)));
        est.push_sample(sample(100_000, 500, Some(2.0)));
        assert!((est.buffer_level_secs() - 4.0).abs() < 1e-9);
        est.reset_buffer();
        assert_eq!(est.buffer_level_secs(), 0.0);
    }
}
