use std::time::Duration;

use web_time::Instant;

/// A selectable representation, reduced to what the ABR algorithm needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Candidate {
    /// Stable index into the adaptation's representation list.
    pub index: usize,
    /// Advertised bitrate in bits per second.
    pub bitrate: u64,
    /// Horizontal resolution, when the representation carries one (video).
    pub width: Option<u32>,
}

/// One observed download, fed to the throughput estimator.
#[derive(Clone, Copy, Debug)]
pub struct ThroughputSample {
    pub bytes: u64,
    pub duration: Duration,
    pub at: Instant,
    /// Media duration the downloaded bytes cover, for buffer-health tracking.
    pub content_duration: Option<Duration>,
}

/// Per-track ABR configuration.
#[derive(Clone, Debug)]
pub struct AbrOptions {
    /// Bitrate assumed before any sample arrives.
    pub initial_bitrate: u64,
    /// Fixed selection; disables adaptation when set.
    pub manual_bitrate: Option<u64>,
    /// Ceiling applied to automatic selection only.
    pub max_auto_bitrate: Option<u64>,
    /// Fraction of the estimate considered spendable (estimate / factor).
    pub safety_factor: f64,
    /// Up-switch requires this much headroom over the candidate bitrate.
    pub up_hysteresis_ratio: f64,
    /// Down-switch margin relative to the current bitrate.
    pub down_hysteresis_ratio: f64,
    /// Buffer level below which a down-switch is taken unconditionally.
    pub down_switch_buffer_secs: f64,
    /// Buffer level required before an up-switch is considered.
    pub min_buffer_for_up_switch_secs: f64,
    /// Minimum interval between emitted changes (debounce).
    pub min_switch_interval: Duration,
}

impl Default for AbrOptions {
    fn default() -> Self {
        Self {
            initial_bitrate: 0,
            manual_bitrate: None,
            max_auto_bitrate: None,
            safety_factor: 1.5,
            up_hysteresis_ratio: 1.3,
            down_hysteresis_ratio: 0.8,
            down_switch_buffer_secs: 5.0,
            min_buffer_for_up_switch_secs: 10.0,
            min_switch_interval: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_auto() {
        let opts = AbrOptions::default();
        assert!(opts.manual_bitrate.is_none());
        assert!(opts.max_auto_bitrate.is_none());
    }
}
