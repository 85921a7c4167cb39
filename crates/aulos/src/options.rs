//! Playback configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aulos_abr::AbrOptions;
use aulos_drm::KeySystemConfig;
use aulos_events::TrackType;
use aulos_net::RetryPolicy;

use crate::text::{Cue, OverlayRenderer};

/// Initial position policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StartAt {
    /// Absolute position on the media timeline, seconds.
    Position(f64),
    /// Wall-clock time, for live contents whose timeline is anchored to it.
    WallClockTime(f64),
    /// Offset from the earliest reachable position.
    FromFirstPosition(f64),
    /// Offset back from the latest reachable position.
    FromLastPosition(f64),
    /// Percentage of the presentation duration, `0.0..=100.0`.
    Percentage(f64),
}

/// Rendering options for the text track's custom sink.
#[derive(Clone)]
pub struct TextTrackOptions {
    pub renderer: Arc<dyn OverlayRenderer>,
}

/// Manually provided track merged into the first period at startup.
#[derive(Clone, Debug)]
pub struct SupplementaryTrack {
    /// `Text` or `Image`.
    pub track: TrackType,
    pub language: Option<String>,
    pub cues: Vec<Cue>,
}

/// Engine configuration, builder-style.
#[derive(Clone)]
pub struct PlayerOptions {
    /// Start playback as soon as the `Loaded` event fires.
    pub auto_play: bool,
    pub start_at: Option<StartAt>,
    /// Feed audio/video through the native source extension.
    pub with_media_source: bool,
    pub initial_speed: f64,

    /// Seconds of media each buffer keeps ahead of the playhead.
    pub wanted_buffer_ahead: f64,
    /// GC horizon ahead of the playhead; `None` keeps everything.
    pub max_buffer_ahead: Option<f64>,
    /// GC horizon behind the playhead; `None` keeps everything.
    pub max_buffer_behind: Option<f64>,

    /// ABR tuning shared by all tracks; per-track bitrate fields below.
    pub abr: AbrOptions,
    pub initial_bitrates: HashMap<TrackType, u64>,
    pub manual_bitrates: HashMap<TrackType, u64>,
    pub max_auto_bitrates: HashMap<TrackType, u64>,

    pub text_track: Option<TextTrackOptions>,
    pub supplementary_tracks: Vec<SupplementaryTrack>,

    pub key_systems: Vec<KeySystemConfig>,
    /// Unset media keys from the element on teardown. Some platforms
    /// misbehave when keys are unset on a live element.
    pub should_unset_media_keys: bool,

    /// Seconds from the end at which playback is considered finished.
    pub end_of_play: f64,
    /// Refresh cadence of overlay/text sinks, milliseconds.
    pub overlay_refresh_interval_ms: u64,
    /// Minimum interval between live manifest refreshes.
    pub live_refresh_min_interval: Duration,

    /// Retry budget around orchestrator startup (manifest, source set-up).
    pub startup_retry: RetryPolicy,
    /// Retry budget of each segment request.
    pub segment_retry: RetryPolicy,
    /// Retry budget of license requests.
    pub license_retry: RetryPolicy,

    pub event_capacity: usize,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            auto_play: false,
            start_at: None,
            with_media_source: true,
            initial_speed: 1.0,
            wanted_buffer_ahead: 30.0,
            max_buffer_ahead: None,
            max_buffer_behind: None,
            abr: AbrOptions::default(),
            initial_bitrates: HashMap::new(),
            manual_bitrates: HashMap::new(),
            max_auto_bitrates: HashMap::new(),
            text_track: None,
            supplementary_tracks: Vec::new(),
            key_systems: Vec::new(),
            should_unset_media_keys: true,
            end_of_play: 0.5,
            overlay_refresh_interval_ms: 250,
            live_refresh_min_interval: Duration::from_secs(3),
            startup_retry: RetryPolicy {
                total_retry: 3,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
                reset_delay: Duration::from_secs(60),
            },
            segment_retry: RetryPolicy::default(),
            license_retry: RetryPolicy::default(),
            event_capacity: 64,
        }
    }
}

impl PlayerOptions {
    #[must_use]
    pub fn with_auto_play(mut self, auto_play: bool) -> Self {
        self.auto_play = auto_play;
        self
    }

    #[must_use]
    pub fn with_start_at(mut self, start_at: StartAt) -> Self {
        self.start_at = Some(start_at);
        self
    }

    #[must_use]
    pub fn with_wanted_buffer_ahead(mut self, seconds: f64) -> Self {
        self.wanted_buffer_ahead = seconds;
        self
    }

    #[must_use]
    pub fn with_buffer_window(mut self, behind: Option<f64>, ahead: Option<f64>) -> Self {
        self.max_buffer_behind = behind;
        self.max_buffer_ahead = ahead;
        self
    }

    #[must_use]
    pub fn with_initial_bitrate(mut self, track: TrackType, bitrate: u64) -> Self {
        self.initial_bitrates.insert(track, bitrate);
        self
    }

    #[must_use]
    pub fn with_manual_bitrate(mut self, track: TrackType, bitrate: u64) -> Self {
        self.manual_bitrates.insert(track, bitrate);
        self
    }

    #[must_use]
    pub fn with_max_auto_bitrate(mut self, track: TrackType, bitrate: u64) -> Self {
        self.max_auto_bitrates.insert(track, bitrate);
        self
    }

    #[must_use]
    pub fn with_key_systems(mut self, key_systems: Vec<KeySystemConfig>) -> Self {
        self.key_systems = key_systems;
        self
    }

    #[must_use]
    pub fn with_end_of_play(mut self, seconds: f64) -> Self {
        self.end_of_play = seconds;
        self
    }

    #[must_use]
    pub fn with_text_track(mut self, options: TextTrackOptions) -> Self {
        self.text_track = Some(options);
        self
    }

    /// Per-track ABR options derived from the shared tuning plus the
    /// per-track bitrate maps.
    #[must_use]
    pub fn abr_options_for(&self, track: TrackType) -> AbrOptions {
        let mut abr = self.abr.clone();
        if let Some(initial) = self.initial_bitrates.get(&track) {
            abr.initial_bitrate = *initial;
        }
        abr.manual_bitrate = self.manual_bitrates.get(&track).copied();
        abr.max_auto_bitrate = self.max_auto_bitrates.get(&track).copied();
        abr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_track_abr_options_pick_up_bitrate_maps() {
        let options = PlayerOptions::default()
            .with_initial_bitrate(TrackType::Video, 700_000)
            .with_manual_bitrate(TrackType::Audio, 96_000)
            .with_max_auto_bitrate(TrackType::Video, 2_000_000);

        let video = options.abr_options_for(TrackType::Video);
        assert_eq!(video.initial_bitrate, 700_000);
        assert_eq!(video.manual_bitrate, None);
        assert_eq!(video.max_auto_bitrate, Some(2_000_000));

        let audio = options.abr_options_for(TrackType::Audio);
        assert_eq!(audio.manual_bitrate, Some(96_000));
        assert_eq!(audio.max_auto_bitrate, None);
    }

    #[test]
    fn defaults_match_documented_values() {
        let options = PlayerOptions::default();
        assert_eq!(options.end_of_play, 0.5);
        assert_eq!(options.startup_retry.total_retry, 3);
        assert_eq!(options.startup_retry.base_delay, Duration::from_millis(250));
        assert_eq!(options.startup_retry.reset_delay, Duration::from_secs(60));
        assert!(options.with_media_source);
    }
}
