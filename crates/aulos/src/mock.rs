//! Scripted implementations of the engine's seams.
//!
//! Everything the engine consumes from the outside world — presentation
//! element, source extension, transport, CDM — exists here in a scripted
//! form so unit and scenario tests can run without a platform. Appended
//! media bytes carry a tiny `seg <start> <end>;` header the mock source
//! buffer parses back into buffered ranges, mirroring how real sinks learn
//! timestamps from the container.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aulos_drm::{Cdm, DrmResult, LicenseRequester, LicenseStorage, StoredSessionRecord};
use aulos_events::{TimeRange, TrackType};
use aulos_net::NetError;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::element::{
    ElementEvent, MediaElement, MediaSourceHandle, ReadyState, SinkError, SourceBufferHandle,
    SourceReadyState,
};
use crate::errors::PlayerResult;
use crate::manifest::{Adaptation, Manifest, Period, Representation, SegmentIndex, SegmentInfo};
use crate::pipeline::{SegmentPayload, SegmentRequest, Transport, TransportError};
use crate::text::Cue;

// ---------------------------------------------------------------------------
// Mock source buffer / media source
// ---------------------------------------------------------------------------

/// Native source buffer that derives buffered ranges from the appended
/// payload headers. Supports a byte quota to exercise GC paths.
pub struct MockSourceBuffer {
    ranges: Mutex<Vec<TimeRange>>,
    appended_bytes: Mutex<usize>,
    quota_bytes: Mutex<Option<usize>>,
    aborted: Mutex<bool>,
    appends: AtomicUsize,
}

impl MockSourceBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ranges: Mutex::new(Vec::new()),
            appended_bytes: Mutex::new(0),
            quota_bytes: Mutex::new(None),
            aborted: Mutex::new(false),
            appends: AtomicUsize::new(0),
        }
    }

    pub fn set_quota(&self, bytes: Option<usize>) {
        *self.quota_bytes.lock() = bytes;
    }

    #[must_use]
    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    /// Drop ranges, simulating platform eviction.
    pub fn evict(&self, range: TimeRange) {
        let mut ranges = self.ranges.lock();
        let mut next = Vec::new();
        for r in ranges.drain(..) {
            if !r.overlaps(&range) {
                next.push(r);
                continue;
            }
            if r.start < range.start {
                next.push(TimeRange::new(r.start, range.start));
            }
            if r.end > range.end {
                next.push(TimeRange::new(range.end, r.end));
            }
        }
        *ranges = next;
    }

    fn merge(&self, added: TimeRange) {
        let mut ranges = self.ranges.lock();
        ranges.push(added);
        ranges.sort_by(|a, b| a.start.total_cmp(&b.start));
        let mut merged: Vec<TimeRange> = Vec::new();
        for r in ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end + 1e-3 => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        *ranges = merged;
    }
}

impl Default for MockSourceBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the `seg <start> <end>;` header of a scripted payload.
#[must_use]
pub fn parse_segment_header(data: &[u8]) -> Option<TimeRange> {
    let text = std::str::from_utf8(&data[..data.len().min(64)]).ok()?;
    let header = text.split(';').next()?;
    let mut parts = header.split_whitespace();
    if parts.next()? != "seg" {
        return None;
    }
    let start: f64 = parts.next()?.parse().ok()?;
    let end: f64 = parts.next()?.parse().ok()?;
    Some(TimeRange::new(start, end))
}

#[async_trait]
impl SourceBufferHandle for MockSourceBuffer {
    async fn append(&self, data: Bytes) -> Result<(), SinkError> {
        if *self.aborted.lock() {
            return Err(SinkError::Aborted);
        }
        let mut appended = self.appended_bytes.lock();
        if let Some(quota) = *self.quota_bytes.lock() {
            if *appended + data.len() > quota {
                return Err(SinkError::QuotaExceeded);
            }
        }
        *appended += data.len();
        drop(appended);

        self.appends.fetch_add(1, Ordering::SeqCst);
        if let Some(range) = parse_segment_header(&data) {
            if !range.is_empty() {
                self.merge(range);
            }
        }
        Ok(())
    }

    async fn remove(&self, range: TimeRange) -> Result<(), SinkError> {
        // Free quota proportionally to what is dropped.
        let dropped: f64 = {
            let ranges = self.ranges.lock();
            ranges
                .iter()
                .map(|r| r.clip(&range).duration())
                .sum::<f64>()
        };
        let total: f64 = {
            let ranges = self.ranges.lock();
            ranges.iter().map(TimeRange::duration).sum()
        };
        if total > 0.0 {
            let mut appended = self.appended_bytes.lock();
            #[expect(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let freed = ((*appended as f64) * (dropped / total)) as usize;
            *appended = appended.saturating_sub(freed);
        }
        self.evict(range);
        Ok(())
    }

    fn abort(&self) {
        *self.aborted.lock() = true;
    }

    fn buffered(&self) -> Vec<TimeRange> {
        self.ranges.lock().clone()
    }
}

/// Scripted source extension. Opens immediately.
pub struct MockMediaSource {
    ready: Mutex<SourceReadyState>,
    duration: Mutex<Option<f64>>,
    buffers: Mutex<HashMap<String, Arc<MockSourceBuffer>>>,
    ended: Mutex<bool>,
}

impl MockMediaSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Mutex::new(SourceReadyState::Open),
            duration: Mutex::new(None),
            buffers: Mutex::new(HashMap::new()),
            ended: Mutex::new(false),
        }
    }

    #[must_use]
    pub fn buffer(&self, sink_type: &str) -> Option<Arc<MockSourceBuffer>> {
        self.buffers.lock().get(sink_type).cloned()
    }

    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().len()
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        *self.ended.lock()
    }

    fn buffered_union(&self) -> Vec<TimeRange> {
        let buffers = self.buffers.lock();
        let mut all: Vec<TimeRange> = buffers
            .values()
            .flat_map(|b| b.buffered())
            .collect();
        all.sort_by(|a, b| a.start.total_cmp(&b.start));
        let mut merged: Vec<TimeRange> = Vec::new();
        for r in all {
            match merged.last_mut() {
                Some(last) if r.start <= last.end + 1e-3 => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        merged
    }
}

impl Default for MockMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSourceHandle for MockMediaSource {
    fn ready_state(&self) -> SourceReadyState {
        *self.ready.lock()
    }

    async fn wait_open(&self) -> PlayerResult<()> {
        Ok(())
    }

    fn set_duration(&self, duration: f64) {
        *self.duration.lock() = Some(duration);
    }

    fn duration(&self) -> f64 {
        self.duration.lock().unwrap_or(f64::NAN)
    }

    fn add_source_buffer(&self, sink_type: &str) -> PlayerResult<Arc<dyn SourceBufferHandle>> {
        let buffer = Arc::new(MockSourceBuffer::new());
        self.buffers
            .lock()
            .insert(sink_type.to_string(), Arc::clone(&buffer));
        Ok(buffer)
    }

    fn remove_source_buffer(&self, sink_type: &str) {
        self.buffers.lock().remove(sink_type);
    }

    fn end_of_stream(&self) {
        *self.ended.lock() = true;
        *self.ready.lock() = SourceReadyState::Ended;
    }
}

// ---------------------------------------------------------------------------
// Mock media element
// ---------------------------------------------------------------------------

struct ElementState {
    src: Option<String>,
    current_time: f64,
    duration: f64,
    playback_rate: f64,
    paused: bool,
    ready_state: ReadyState,
    manual_buffered: Vec<TimeRange>,
}

/// Scripted presentation element.
pub struct MockMediaElement {
    state: Mutex<ElementState>,
    events_tx: broadcast::Sender<ElementEvent>,
    media_source: Mutex<Option<Arc<MockMediaSource>>>,
    attachments: AtomicUsize,
    revoked: AtomicUsize,
}

impl MockMediaElement {
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(ElementState {
                src: None,
                current_time: 0.0,
                duration: f64::NAN,
                playback_rate: 1.0,
                paused: true,
                ready_state: ReadyState::HaveNothing,
                manual_buffered: Vec::new(),
            }),
            events_tx,
            media_source: Mutex::new(None),
            attachments: AtomicUsize::new(0),
            revoked: AtomicUsize::new(0),
        }
    }

    pub fn fire(&self, event: ElementEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn set_current_time(&self, time: f64) {
        self.state.lock().current_time = time;
    }

    pub fn set_duration_value(&self, duration: f64) {
        self.state.lock().duration = duration;
    }

    pub fn set_ready_state(&self, ready_state: ReadyState) {
        self.state.lock().ready_state = ready_state;
    }

    pub fn set_buffered(&self, ranges: Vec<TimeRange>) {
        self.state.lock().manual_buffered = ranges;
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
    }

    #[must_use]
    pub fn revoked_attachments(&self) -> usize {
        self.revoked.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn media_source(&self) -> Option<Arc<MockMediaSource>> {
        self.media_source.lock().clone()
    }

    #[must_use]
    pub fn media_source_duration(&self) -> Option<f64> {
        self.media_source
            .lock()
            .as_ref()
            .map(|ms| MediaSourceHandle::duration(ms.as_ref()))
    }
}

impl Default for MockMediaElement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaElement for MockMediaElement {
    fn set_src(&self, src: Option<String>) {
        self.state.lock().src = src;
    }

    fn src(&self) -> Option<String> {
        self.state.lock().src.clone()
    }

    fn current_time(&self) -> f64 {
        self.state.lock().current_time
    }

    fn seek(&self, time: f64) {
        self.state.lock().current_time = time;
        self.fire(ElementEvent::Seeking);
        self.fire(ElementEvent::Seeked);
    }

    fn duration(&self) -> f64 {
        let state = self.state.lock();
        if state.duration.is_nan() {
            if let Some(ms) = self.media_source.lock().as_ref() {
                return MediaSourceHandle::duration(ms.as_ref());
            }
        }
        state.duration
    }

    fn playback_rate(&self) -> f64 {
        self.state.lock().playback_rate
    }

    fn set_playback_rate(&self, rate: f64) {
        self.state.lock().playback_rate = rate;
    }

    fn paused(&self) -> bool {
        self.state.lock().paused
    }

    async fn play(&self) -> PlayerResult<()> {
        self.state.lock().paused = false;
        Ok(())
    }

    fn pause(&self) {
        self.state.lock().paused = true;
    }

    fn ready_state(&self) -> ReadyState {
        self.state.lock().ready_state
    }

    fn buffered(&self) -> Vec<TimeRange> {
        let manual = self.state.lock().manual_buffered.clone();
        if !manual.is_empty() {
            return manual;
        }
        self.media_source
            .lock()
            .as_ref()
            .map(|ms| ms.buffered_union())
            .unwrap_or_default()
    }

    fn events(&self) -> broadcast::Receiver<ElementEvent> {
        self.events_tx.subscribe()
    }

    fn open_media_source(&self) -> PlayerResult<(Arc<dyn MediaSourceHandle>, String)> {
        let media_source = Arc::new(MockMediaSource::new());
        *self.media_source.lock() = Some(Arc::clone(&media_source));
        let n = self.attachments.fetch_add(1, Ordering::SeqCst);
        Ok((media_source, format!("mock://attachment-{n}")))
    }

    fn revoke_attachment(&self, _attachment: &str) {
        self.revoked.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Manifest builders
// ---------------------------------------------------------------------------

/// Uniform-template representation.
#[must_use]
pub fn make_representation(
    id: &str,
    track: TrackType,
    bitrate: u64,
    segment_duration: f64,
    period_start: f64,
    period_duration: f64,
) -> Representation {
    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let count = (period_duration / segment_duration).ceil() as u64;
    let (mime_type, codecs) = match track {
        TrackType::Audio => ("audio/mp4", "mp4a.40.2"),
        TrackType::Video => ("video/mp4", "avc1.64001f"),
        TrackType::Text => ("application/ttml+xml", "ttml"),
        TrackType::Image => ("image/jpeg", "jpeg"),
    };
    Representation {
        id: id.to_string(),
        bitrate,
        mime_type: mime_type.to_string(),
        codecs: codecs.to_string(),
        width: None,
        init_segment: Some(SegmentInfo {
            id: format!("{id}-init"),
            time: period_start,
            duration: 0.0,
            media_range: None,
            index_range: None,
            is_init: true,
        }),
        index: SegmentIndex::Template {
            start: period_start,
            segment_duration,
            count: Some(count),
        },
    }
}

/// Period with one adaptation per `(track, bitrates)` entry.
#[must_use]
pub fn make_period(
    id: &str,
    start: f64,
    duration: Option<f64>,
    tracks: &[(TrackType, &[u64])],
) -> Period {
    let mut adaptations: HashMap<TrackType, Vec<Adaptation>> = HashMap::new();
    let span = duration.unwrap_or(60.0);
    for (track, bitrates) in tracks {
        let representations = bitrates
            .iter()
            .enumerate()
            .map(|(i, bitrate)| {
                make_representation(&format!("{id}-{track}-{i}"), *track, *bitrate, 2.0, start, span)
            })
            .collect();
        adaptations.insert(
            *track,
            vec![Adaptation {
                id: format!("{id}-{track}"),
                track_type: *track,
                language: None,
                representations,
            }],
        );
    }
    Period {
        id: id.to_string(),
        start,
        duration,
        adaptations,
    }
}

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

/// Transport whose manifest and network behavior are scripted per test.
pub struct ScriptedTransport {
    manifest: Mutex<Manifest>,
    /// When set, segment loads sleep `bytes * 8 / bps` (tokio time).
    throughput_bps: Mutex<Option<u64>>,
    /// `(remaining failures, retryable)` injected into segment loads.
    fail_segments: Mutex<Option<(u32, bool)>>,
    fail_manifests: Mutex<u32>,
    segment_loads: AtomicUsize,
    manifest_loads: AtomicUsize,
    /// Presentation time of every loaded segment, in request order.
    segment_times: Mutex<Vec<f64>>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn with_manifest(manifest: Manifest) -> Self {
        Self {
            manifest: Mutex::new(manifest),
            throughput_bps: Mutex::new(None),
            fail_segments: Mutex::new(None),
            fail_manifests: Mutex::new(0),
            segment_loads: AtomicUsize::new(0),
            manifest_loads: AtomicUsize::new(0),
            segment_times: Mutex::new(Vec::new()),
        }
    }

    /// One period, one 100 kbps audio and one 1 Mbps video representation,
    /// 2 s segments.
    #[must_use]
    pub fn vod_single_period(duration: f64) -> Self {
        let period = make_period(
            "p1",
            0.0,
            Some(duration),
            &[
                (TrackType::Audio, &[100_000][..]),
                (TrackType::Video, &[1_000_000][..]),
            ],
        );
        Self::with_manifest(Manifest::new(vec![period], false, Some(duration), None))
    }

    /// One period with a video bitrate ladder.
    #[must_use]
    pub fn vod_video_ladder(duration: f64, bitrates: &[u64]) -> Self {
        let period = make_period("p1", 0.0, Some(duration), &[(TrackType::Video, bitrates)]);
        Self::with_manifest(Manifest::new(vec![period], false, Some(duration), None))
    }

    /// Two back-to-back periods of `d1` and `d2` seconds.
    #[must_use]
    pub fn two_periods(d1: f64, d2: f64) -> Self {
        let tracks = [
            (TrackType::Audio, &[100_000][..]),
            (TrackType::Video, &[1_000_000][..]),
        ];
        let p1 = make_period("p1", 0.0, Some(d1), &tracks);
        let p2 = make_period("p2", d1, Some(d2), &tracks);
        Self::with_manifest(Manifest::new(vec![p1, p2], false, Some(d1 + d2), None))
    }

    /// Live manifest whose single period currently ends at `end`.
    #[must_use]
    pub fn live(end: f64) -> Self {
        let period = make_period(
            "p1",
            0.0,
            Some(end),
            &[
                (TrackType::Audio, &[100_000][..]),
                (TrackType::Video, &[1_000_000][..]),
            ],
        );
        Self::with_manifest(Manifest::new(vec![period], true, None, None))
    }

    /// Replace the manifest served to subsequent loads.
    pub fn set_manifest(&self, manifest: Manifest) {
        *self.manifest.lock() = manifest;
    }

    /// Extend the live period up to `new_end`.
    pub fn extend_live(&self, new_end: f64) {
        let period = make_period(
            "p1",
            0.0,
            Some(new_end),
            &[
                (TrackType::Audio, &[100_000][..]),
                (TrackType::Video, &[1_000_000][..]),
            ],
        );
        self.set_manifest(Manifest::new(vec![period], true, None, None));
    }

    pub fn set_throughput(&self, bps: Option<u64>) {
        *self.throughput_bps.lock() = bps;
    }

    pub fn fail_next_segment_loads(&self, count: u32, retryable: bool) {
        *self.fail_segments.lock() = Some((count, retryable));
    }

    pub fn fail_next_manifest_loads(&self, count: u32) {
        *self.fail_manifests.lock() = count;
    }

    #[must_use]
    pub fn segment_load_count(&self) -> usize {
        self.segment_loads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn manifest_load_count(&self) -> usize {
        self.manifest_loads.load(Ordering::SeqCst)
    }

    /// Presentation times of loaded segments since the last clear.
    #[must_use]
    pub fn segment_times(&self) -> Vec<f64> {
        self.segment_times.lock().clone()
    }

    pub fn clear_segment_times(&self) {
        self.segment_times.lock().clear();
    }

    fn segment_bytes(request: &SegmentRequest) -> Bytes {
        if request.segment.is_init {
            return Bytes::from_static(b"init;");
        }
        let header = format!(
            "seg {} {};",
            request.segment.time,
            request.segment.end()
        );
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let size = ((request.representation.bitrate as f64 / 8.0) * request.segment.duration)
            .max(header.len() as f64) as usize;
        let mut data = Vec::with_capacity(size);
        data.extend_from_slice(header.as_bytes());
        data.resize(size, 0);
        Bytes::from(data)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn load_manifest(
        &self,
        _url: &Url,
        _cancel: &CancellationToken,
    ) -> Result<Manifest, TransportError> {
        self.manifest_loads.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.fail_manifests.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(NetError::Timeout.into());
            }
        }
        Ok(self.manifest.lock().clone())
    }

    async fn load_segment(
        &self,
        request: &SegmentRequest,
        cancel: &CancellationToken,
    ) -> Result<Bytes, TransportError> {
        self.segment_loads.fetch_add(1, Ordering::SeqCst);
        self.segment_times.lock().push(request.segment.time);
        if !request.segment.is_init {
            let mut fail = self.fail_segments.lock();
            if let Some((remaining, retryable)) = fail.as_mut() {
                if *remaining > 0 {
                    *remaining -= 1;
                    let status = if *retryable { 503 } else { 404 };
                    return Err(NetError::Status {
                        status,
                        url: Url::parse("https://example.com/segment").expect("static url"),
                    }
                    .into());
                }
            }
        }

        let data = Self::segment_bytes(request);
        let throughput = *self.throughput_bps.lock();
        if let Some(bps) = throughput {
            #[expect(clippy::cast_precision_loss)]
            let secs = (data.len() as f64) * 8.0 / (bps as f64);
            tokio::select! {
                () = cancel.cancelled() => return Err(NetError::Cancelled.into()),
                () = tokio::time::sleep(Duration::from_secs_f64(secs)) => {}
            }
        }
        Ok(data)
    }

    fn parse_segment(
        &self,
        bytes: Bytes,
        request: &SegmentRequest,
    ) -> Result<SegmentPayload, TransportError> {
        let cues = match request.track {
            TrackType::Text | TrackType::Image => vec![Cue {
                start: request.segment.time,
                end: request.segment.end(),
                payload: format!("cue-{}", request.segment.id),
            }],
            TrackType::Audio | TrackType::Video => Vec::new(),
        };
        Ok(SegmentPayload {
            data: bytes,
            range: request.segment.range(),
            cues,
        })
    }
}

// ---------------------------------------------------------------------------
// Mock CDM / license plumbing
// ---------------------------------------------------------------------------

/// CDM accepting a fixed set of key systems, logging every call.
pub struct MockCdm {
    accept: Vec<String>,
    ops: Mutex<Vec<String>>,
    sessions: AtomicUsize,
}

impl MockCdm {
    #[must_use]
    pub fn accepting(accept: &[&str]) -> Self {
        Self {
            accept: accept.iter().map(ToString::to_string).collect(),
            ops: Mutex::new(Vec::new()),
            sessions: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }
}

#[async_trait]
impl Cdm for MockCdm {
    async fn supports(&self, key_system: &str, _persistent: bool) -> bool {
        self.ops.lock().push(format!("supports:{key_system}"));
        self.accept.iter().any(|k| k == key_system)
    }

    async fn create_media_keys(&self, key_system: &str) -> DrmResult<()> {
        self.ops.lock().push(format!("create:{key_system}"));
        Ok(())
    }

    async fn attach_media_keys(&self) -> DrmResult<()> {
        self.ops.lock().push("attach".into());
        Ok(())
    }

    async fn set_server_certificate(&self, _certificate: &[u8]) -> DrmResult<()> {
        self.ops.lock().push("certificate".into());
        Ok(())
    }

    async fn open_session(
        &self,
        init_data_type: &str,
        _init_data: &[u8],
        _persistent: bool,
    ) -> DrmResult<(String, Bytes)> {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().push(format!("open:{init_data_type}"));
        Ok((format!("session-{n}"), Bytes::from_static(b"challenge")))
    }

    async fn load_session(&self, session_id: &str) -> DrmResult<bool> {
        self.ops.lock().push(format!("load:{session_id}"));
        Ok(false)
    }

    async fn update_session(&self, session_id: &str, _license: &[u8]) -> DrmResult<()> {
        self.ops.lock().push(format!("update:{session_id}"));
        Ok(())
    }

    async fn close_session(&self, session_id: &str) -> DrmResult<()> {
        self.ops.lock().push(format!("close:{session_id}"));
        Ok(())
    }

    async fn clear_media_keys(&self) -> DrmResult<()> {
        self.ops.lock().push("clear".into());
        Ok(())
    }
}

/// License requester answering immediately.
pub struct EchoLicense;

#[async_trait]
impl LicenseRequester for EchoLicense {
    async fn request_license(&self, _challenge: Bytes) -> DrmResult<Bytes> {
        Ok(Bytes::from_static(b"license"))
    }
}

/// In-memory license storage.
#[derive(Default)]
pub struct MemLicenseStorage {
    records: Mutex<Vec<StoredSessionRecord>>,
}

impl LicenseStorage for MemLicenseStorage {
    fn load(&self) -> Vec<StoredSessionRecord> {
        self.records.lock().clone()
    }

    fn save(&self, records: Vec<StoredSessionRecord>) {
        *self.records.lock() = records;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_header_round_trips() {
        let transport = ScriptedTransport::vod_single_period(60.0);
        let manifest = transport.manifest.lock().clone();
        let period = manifest.first_period().unwrap();
        let adaptation = &period.adaptations_of(TrackType::Video)[0];
        let representation = adaptation.representations[0].clone();
        let segment = representation
            .index
            .segments_in(TimeRange::new(4.0, 6.0))
            .remove(0);

        let request = SegmentRequest {
            track: TrackType::Video,
            period_id: period.id.clone(),
            adaptation_id: adaptation.id.clone(),
            representation,
            segment,
        };
        let bytes = ScriptedTransport::segment_bytes(&request);
        assert_eq!(parse_segment_header(&bytes), Some(TimeRange::new(4.0, 6.0)));
        // 1 Mbps * 2 s / 8 = 250 kB
        assert_eq!(bytes.len(), 250_000);
    }

    #[tokio::test]
    async fn source_buffer_learns_ranges_from_appends() {
        let buffer = MockSourceBuffer::new();
        buffer
            .append(Bytes::from_static(b"seg 0 2;xxxx"))
            .await
            .unwrap();
        buffer
            .append(Bytes::from_static(b"seg 2 4;xxxx"))
            .await
            .unwrap();
        assert_eq!(buffer.buffered(), vec![TimeRange::new(0.0, 4.0)]);
    }

    #[tokio::test]
    async fn source_buffer_quota_rejects_appends() {
        let buffer = MockSourceBuffer::new();
        buffer.set_quota(Some(16));
        buffer
            .append(Bytes::from_static(b"seg 0 2;xxxx"))
            .await
            .unwrap();
        let result = buffer.append(Bytes::from_static(b"seg 2 4;xxxx")).await;
        assert_eq!(result, Err(SinkError::QuotaExceeded));

        // Removing media frees quota again.
        buffer.remove(TimeRange::new(0.0, 2.0)).await.unwrap();
        buffer
            .append(Bytes::from_static(b"seg 2 4;xxxx"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn element_buffered_reflects_media_source() {
        let element = MockMediaElement::new();
        let (_ms, _url) = element.open_media_source().unwrap();
        let ms = element.media_source().unwrap();
        let buffer = ms.add_source_buffer("video/mp4").unwrap();
        buffer
            .append(Bytes::from_static(b"seg 0 2;xxxx"))
            .await
            .unwrap();
        assert_eq!(element.buffered(), vec![TimeRange::new(0.0, 2.0)]);
    }
}
