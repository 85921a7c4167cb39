//! Presentation surface.
//!
//! Wraps the media element and its source-extension lifecycle. The surface
//! exclusively owns sinks; buffers only borrow handles for the duration of
//! a period. Whatever path execution takes out of a playback, teardown
//! guarantees: all sinks aborted, the attachment revoked, `src` cleared.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aulos_events::{ErrorCode, TimeRange, TrackType};
use bytes::Bytes;
use tracing::{debug, warn};
use url::Url;

use crate::element::{
    MediaElement, MediaSourceHandle, ReadyState, SinkError, SourceBufferHandle, SourceReadyState,
};
use crate::errors::{PlayerError, PlayerResult};
use crate::manifest::MAX_SOURCE_DURATION;
use crate::pipeline::SegmentPayload;

/// Append target borrowed by adaptation buffers.
///
/// `Native` sinks are backed by the platform source extension; `Custom`
/// sinks (text/image) live in-process, see [`crate::text::TextSink`].
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn append(&self, payload: SegmentPayload) -> Result<(), SinkError>;

    async fn remove(&self, range: TimeRange) -> Result<(), SinkError>;

    fn abort(&self);

    fn buffered(&self) -> Vec<TimeRange>;
}

impl std::fmt::Debug for dyn MediaSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn MediaSink").finish_non_exhaustive()
    }
}

/// Native sink over a source buffer.
pub struct NativeSink {
    buffer: Arc<dyn SourceBufferHandle>,
}

impl NativeSink {
    #[must_use]
    pub fn new(buffer: Arc<dyn SourceBufferHandle>) -> Self {
        Self { buffer }
    }
}

#[async_trait]
impl MediaSink for NativeSink {
    async fn append(&self, payload: SegmentPayload) -> Result<(), SinkError> {
        self.buffer.append(payload.data).await
    }

    async fn remove(&self, range: TimeRange) -> Result<(), SinkError> {
        self.buffer.remove(range).await
    }

    fn abort(&self) {
        self.buffer.abort();
    }

    fn buffered(&self) -> Vec<TimeRange> {
        self.buffer.buffered()
    }
}

struct SinkEntry {
    sink: Arc<dyn MediaSink>,
    /// Content type for native sinks, used for codec-change detection.
    sink_type: Option<String>,
}

/// Media element + source extension lifecycle.
pub struct Surface {
    element: Arc<dyn MediaElement>,
    media_source: Option<Arc<dyn MediaSourceHandle>>,
    attachment: Option<String>,
    sinks: HashMap<TrackType, SinkEntry>,
    torn_down: bool,
}

impl Surface {
    /// Reset the element and attach it to `url`, through a source extension
    /// when `with_media_source` is set.
    pub fn open(
        element: Arc<dyn MediaElement>,
        url: &Url,
        with_media_source: bool,
    ) -> PlayerResult<Self> {
        // Reset whatever a previous playback may have left behind.
        element.set_src(None);

        let (media_source, attachment) = if with_media_source {
            let (media_source, attachment) = element.open_media_source()?;
            element.set_src(Some(attachment.clone()));
            (Some(media_source), Some(attachment))
        } else {
            element.set_src(Some(url.to_string()));
            (None, None)
        };

        debug!(url = %url, with_media_source, "surface opened");
        Ok(Self {
            element,
            media_source,
            attachment,
            sinks: HashMap::new(),
            torn_down: false,
        })
    }

    #[must_use]
    pub fn element(&self) -> &Arc<dyn MediaElement> {
        &self.element
    }

    /// Resolve once the source extension is open. Immediate without one.
    pub async fn wait_source_open(&self) -> PlayerResult<()> {
        match &self.media_source {
            Some(media_source) => media_source.wait_open().await,
            None => Ok(()),
        }
    }

    /// Set the presentation duration; non-finite values are persisted as
    /// [`MAX_SOURCE_DURATION`].
    pub fn set_duration(&self, duration: f64) {
        let duration = if duration.is_finite() {
            duration
        } else {
            MAX_SOURCE_DURATION
        };
        if let Some(media_source) = &self.media_source {
            media_source.set_duration(duration);
        }
    }

    /// Create the native sink for `track`.
    ///
    /// Only legal while the source extension is open and before the element
    /// reached `HAVE_METADATA`; exactly one native sink may exist per track
    /// type.
    pub fn add_native_sink(
        &mut self,
        track: TrackType,
        sink_type: &str,
    ) -> PlayerResult<Arc<dyn MediaSink>> {
        if !track.is_native() {
            return Err(PlayerError::media(
                ErrorCode::MediaSourceOpenError,
                format!("{track} tracks use custom sinks"),
                true,
            ));
        }
        if self.sinks.contains_key(&track) {
            return Err(PlayerError::media(
                ErrorCode::MediaSourceOpenError,
                format!("a {track} sink already exists"),
                true,
            ));
        }
        let media_source = self.media_source.as_ref().ok_or_else(|| {
            PlayerError::media(
                ErrorCode::MediaSourceOpenError,
                "native sinks require a media source",
                true,
            )
        })?;
        if media_source.ready_state() != SourceReadyState::Open {
            return Err(PlayerError::media(
                ErrorCode::MediaSourceOpenError,
                "source extension is not open",
                true,
            ));
        }
        if self.element.ready_state() >= ReadyState::HaveMetadata {
            return Err(PlayerError::media(
                ErrorCode::MediaSourceOpenError,
                "native sinks must be created before HAVE_METADATA",
                true,
            ));
        }

        let buffer = media_source.add_source_buffer(sink_type)?;
        let sink: Arc<dyn MediaSink> = Arc::new(NativeSink::new(buffer));
        debug!(%track, sink_type, "native sink created");
        self.sinks.insert(
            track,
            SinkEntry {
                sink: Arc::clone(&sink),
                sink_type: Some(sink_type.to_string()),
            },
        );
        Ok(sink)
    }

    /// Register a custom (in-process) sink for a non-native track.
    pub fn add_custom_sink(
        &mut self,
        track: TrackType,
        sink: Arc<dyn MediaSink>,
    ) -> PlayerResult<Arc<dyn MediaSink>> {
        if track.is_native() {
            return Err(PlayerError::media(
                ErrorCode::MediaSourceOpenError,
                format!("{track} tracks use native sinks"),
                true,
            ));
        }
        if self.sinks.contains_key(&track) {
            return Err(PlayerError::media(
                ErrorCode::MediaSourceOpenError,
                format!("a {track} sink already exists"),
                true,
            ));
        }
        self.sinks.insert(
            track,
            SinkEntry {
                sink: Arc::clone(&sink),
                sink_type: None,
            },
        );
        Ok(sink)
    }

    /// Replace the native sink of `track` for a codec change at a period
    /// transition. The old sink is aborted and its source buffer released.
    pub fn replace_native_sink(
        &mut self,
        track: TrackType,
        sink_type: &str,
    ) -> PlayerResult<Arc<dyn MediaSink>> {
        let media_source = self.media_source.as_ref().ok_or_else(|| {
            PlayerError::media(
                ErrorCode::MediaSourceOpenError,
                "native sinks require a media source",
                true,
            )
        })?;
        if let Some(previous) = self.sinks.remove(&track) {
            previous.sink.abort();
            if let Some(previous_type) = &previous.sink_type {
                media_source.remove_source_buffer(previous_type);
            }
        }
        let buffer = media_source.add_source_buffer(sink_type)?;
        let sink: Arc<dyn MediaSink> = Arc::new(NativeSink::new(buffer));
        debug!(%track, sink_type, "native sink replaced");
        self.sinks.insert(
            track,
            SinkEntry {
                sink: Arc::clone(&sink),
                sink_type: Some(sink_type.to_string()),
            },
        );
        Ok(sink)
    }

    /// Abort and drop the sink of `track`.
    pub fn remove_sink(&mut self, track: TrackType) {
        if let Some(entry) = self.sinks.remove(&track) {
            entry.sink.abort();
            if let (Some(media_source), Some(sink_type)) =
                (&self.media_source, &entry.sink_type)
            {
                media_source.remove_source_buffer(sink_type);
            }
            debug!(%track, "sink removed");
        }
    }

    #[must_use]
    pub fn sink(&self, track: TrackType) -> Option<Arc<dyn MediaSink>> {
        self.sinks.get(&track).map(|e| Arc::clone(&e.sink))
    }

    #[must_use]
    pub fn sink_type(&self, track: TrackType) -> Option<&str> {
        self.sinks.get(&track).and_then(|e| e.sink_type.as_deref())
    }

    #[must_use]
    pub fn native_sink_count(&self) -> usize {
        self.sinks
            .values()
            .filter(|e| e.sink_type.is_some())
            .count()
    }

    /// Signal that no further media will be appended.
    pub fn end_of_stream(&self) {
        if let Some(media_source) = &self.media_source {
            media_source.end_of_stream();
        }
    }

    /// Return the element to its pre-open observable state. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        for (track, entry) in self.sinks.drain() {
            entry.sink.abort();
            debug!(%track, "sink aborted during teardown");
        }
        self.media_source = None;
        if let Some(attachment) = self.attachment.take() {
            self.element.revoke_attachment(&attachment);
        }
        self.element.set_src(None);
        self.torn_down = true;
        debug!("surface torn down");
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if !self.torn_down {
            warn!("surface dropped without explicit teardown");
            self.teardown();
        }
    }
}

/// Payload helper for native appends of raw bytes (init segments).
#[must_use]
pub fn init_payload(data: Bytes) -> SegmentPayload {
    SegmentPayload {
        data,
        range: TimeRange::new(0.0, 0.0),
        cues: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use crate::mock::MockMediaElement;
    use crate::text::{NullRenderer, TextSink};

    use super::*;

    fn test_url() -> Url {
        Url::parse("https://example.com/manifest.mpd").expect("valid url")
    }

    #[tokio::test]
    async fn open_attaches_media_source() {
        let element = Arc::new(MockMediaElement::new());
        let surface = Surface::open(element.clone(), &test_url(), true).unwrap();
        assert!(element.src().is_some());
        surface.wait_source_open().await.unwrap();
        let mut surface = surface;
        surface.teardown();
    }

    #[tokio::test]
    async fn open_without_media_source_sets_src_directly() {
        let element = Arc::new(MockMediaElement::new());
        let mut surface = Surface::open(element.clone(), &test_url(), false).unwrap();
        assert_eq!(element.src().as_deref(), Some(test_url().as_str()));
        surface.teardown();
    }

    #[tokio::test]
    async fn native_sinks_are_unique_per_track() {
        let element = Arc::new(MockMediaElement::new());
        let mut surface = Surface::open(element, &test_url(), true).unwrap();
        surface.wait_source_open().await.unwrap();

        surface
            .add_native_sink(TrackType::Video, "video/mp4; codecs=\"avc1\"")
            .unwrap();
        let error = surface
            .add_native_sink(TrackType::Video, "video/mp4; codecs=\"avc1\"")
            .unwrap_err();
        assert_eq!(error.code(), ErrorCode::MediaSourceOpenError);
        assert_eq!(surface.native_sink_count(), 1);
        surface.teardown();
    }

    #[tokio::test]
    async fn native_sink_rejected_after_have_metadata() {
        let element = Arc::new(MockMediaElement::new());
        let mut surface = Surface::open(element.clone(), &test_url(), true).unwrap();
        surface.wait_source_open().await.unwrap();

        element.set_ready_state(ReadyState::HaveMetadata);
        let error = surface
            .add_native_sink(TrackType::Audio, "audio/mp4; codecs=\"mp4a\"")
            .unwrap_err();
        assert_eq!(error.code(), ErrorCode::MediaSourceOpenError);
        surface.teardown();
    }

    #[tokio::test]
    async fn custom_sinks_rejected_for_native_tracks() {
        let element = Arc::new(MockMediaElement::new());
        let mut surface = Surface::open(element, &test_url(), true).unwrap();
        let sink = Arc::new(TextSink::new(Arc::new(NullRenderer), 200));
        assert!(surface.add_custom_sink(TrackType::Video, sink).is_err());
        surface.teardown();
    }

    #[tokio::test]
    async fn teardown_restores_pre_open_state() {
        let element = Arc::new(MockMediaElement::new());
        let src_before = element.src();
        let mut surface = Surface::open(element.clone(), &test_url(), true).unwrap();
        surface.wait_source_open().await.unwrap();
        surface
            .add_native_sink(TrackType::Video, "video/mp4; codecs=\"avc1\"")
            .unwrap();

        surface.teardown();
        assert_eq!(element.src(), src_before);
        assert!(element.revoked_attachments() >= 1);
        assert_eq!(surface.native_sink_count(), 0);

        // Idempotent.
        surface.teardown();
        assert_eq!(element.revoked_attachments(), 1);
    }

    #[tokio::test]
    async fn infinite_duration_is_clamped() {
        let element = Arc::new(MockMediaElement::new());
        let mut surface = Surface::open(element.clone(), &test_url(), true).unwrap();
        surface.wait_source_open().await.unwrap();
        surface.set_duration(f64::INFINITY);
        let duration = element.media_source_duration().unwrap();
        assert!(duration.is_finite());
        assert_eq!(duration, MAX_SOURCE_DURATION);
        surface.teardown();
    }

    #[tokio::test]
    async fn replace_native_sink_swaps_source_buffer() {
        let element = Arc::new(MockMediaElement::new());
        let mut surface = Surface::open(element, &test_url(), true).unwrap();
        surface.wait_source_open().await.unwrap();
        surface
            .add_native_sink(TrackType::Video, "video/mp4; codecs=\"avc1\"")
            .unwrap();

        surface
            .replace_native_sink(TrackType::Video, "video/mp4; codecs=\"hvc1\"")
            .unwrap();
        assert_eq!(
            surface.sink_type(TrackType::Video),
            Some("video/mp4; codecs=\"hvc1\"")
        );
        assert_eq!(surface.native_sink_count(), 1);
        surface.teardown();
    }
}
