//! Segment download + parse path.
//!
//! One [`SegmentPipeline`] exists per track. It drives the host-provided
//! [`Transport`] with bounded-backoff retries, caches init segments per
//! representation, keeps at most one request in flight (a new request
//! cancels the previous one), and publishes throughput metrics for the ABR
//! coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aulos_abr::ThroughputSample;
use aulos_events::{ErrorCode, TimeRange, TrackType};
use aulos_net::{retry_with_backoff, NetError, RetryPolicy};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;
use web_time::Instant;

use crate::errors::{PlayerError, PlayerResult};
use crate::manifest::{Manifest, Representation, SegmentInfo};
use crate::text::Cue;

/// Transport-level failure, classified retryable-vs-fatal.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error("parse failed: {reason}")]
    Parse { reason: String, retryable: bool },
}

impl TransportError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Net(net) => net.is_retryable(),
            Self::Parse { retryable, .. } => *retryable,
        }
    }
}

/// Everything the transport needs to locate one segment.
#[derive(Clone, Debug)]
pub struct SegmentRequest {
    pub track: TrackType,
    pub period_id: String,
    pub adaptation_id: String,
    pub representation: Representation,
    pub segment: SegmentInfo,
}

/// Parsed segment ready for a sink.
#[derive(Clone, Debug)]
pub struct SegmentPayload {
    pub data: Bytes,
    /// Presentation range the payload covers.
    pub range: TimeRange,
    /// Renderable cues, for text/image tracks.
    pub cues: Vec<Cue>,
}

/// Media transport seam: a loader/parser pair per resource kind.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn load_manifest(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<Manifest, TransportError>;

    async fn load_segment(
        &self,
        request: &SegmentRequest,
        cancel: &CancellationToken,
    ) -> Result<Bytes, TransportError>;

    fn parse_segment(
        &self,
        bytes: Bytes,
        request: &SegmentRequest,
    ) -> Result<SegmentPayload, TransportError>;
}

/// Throughput observation published for the ABR coordinator.
#[derive(Clone, Copy, Debug)]
pub struct PipelineMetrics {
    pub track: TrackType,
    pub sample: ThroughputSample,
}

#[derive(Clone, Copy, Debug)]
pub struct FetchMetrics {
    pub bytes: u64,
    pub duration: Duration,
}

#[derive(Clone, Debug)]
pub struct FetchedSegment {
    pub payload: SegmentPayload,
    pub metrics: FetchMetrics,
}

/// Per-track segment fetch path.
pub struct SegmentPipeline {
    track: TrackType,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    metrics_tx: broadcast::Sender<PipelineMetrics>,
    /// representation id -> cached init bytes
    init_cache: HashMap<String, Bytes>,
    cancel: CancellationToken,
    inflight: Option<CancellationToken>,
}

impl SegmentPipeline {
    #[must_use]
    pub fn new(
        track: TrackType,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        metrics_tx: broadcast::Sender<PipelineMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            track,
            transport,
            retry,
            metrics_tx,
            init_cache: HashMap::new(),
            cancel,
            inflight: None,
        }
    }

    /// Fetch and parse one media segment.
    ///
    /// Cancels any request still in flight; the retry budget covers both
    /// the download and retryable parse failures.
    pub async fn fetch(&mut self, request: &SegmentRequest) -> PlayerResult<FetchedSegment> {
        let token = self.arm_request();
        let transport = Arc::clone(&self.transport);

        let started = Instant::now();
        let payload = retry_with_backoff(
            &self.retry,
            || {
                let transport = Arc::clone(&transport);
                let token = token.clone();
                async move {
                    let bytes = transport.load_segment(request, &token).await?;
                    transport.parse_segment(bytes, request)
                }
            },
            TransportError::is_retryable,
        )
        .await
        .map_err(|error| segment_error(&error))?;
        let duration = started.elapsed();

        let bytes = payload.data.len() as u64;
        trace!(
            track = %self.track,
            segment = %request.segment.id,
            bytes,
            duration_ms = duration.as_millis() as u64,
            "segment fetched"
        );
        self.publish_metrics(bytes, duration, Some(request.segment.duration));

        Ok(FetchedSegment {
            payload,
            metrics: FetchMetrics { bytes, duration },
        })
    }

    /// Fetch the init segment of `request`'s representation, once.
    ///
    /// Idempotent per representation; later calls return the cached bytes.
    /// `Ok(None)` when the representation has no init segment.
    pub async fn fetch_init(&mut self, request: &SegmentRequest) -> PlayerResult<Option<Bytes>> {
        let representation_id = request.representation.id.clone();
        if let Some(cached) = self.init_cache.get(&representation_id) {
            return Ok(Some(cached.clone()));
        }
        let Some(init) = request.representation.init_segment.clone() else {
            return Ok(None);
        };

        let init_request = SegmentRequest {
            segment: init,
            ..request.clone()
        };
        let token = self.arm_request();
        let transport = Arc::clone(&self.transport);
        let bytes = retry_with_backoff(
            &self.retry,
            || {
                let transport = Arc::clone(&transport);
                let token = token.clone();
                let init_request = init_request.clone();
                async move { transport.load_segment(&init_request, &token).await }
            },
            TransportError::is_retryable,
        )
        .await
        .map_err(|error| segment_error(&error))?;

        debug!(
            track = %self.track,
            representation = %representation_id,
            bytes = bytes.len(),
            "init segment cached"
        );
        self.init_cache.insert(representation_id, bytes.clone());
        Ok(Some(bytes))
    }

    /// Cancel the in-flight request, if any.
    pub fn cancel_inflight(&mut self) {
        if let Some(token) = self.inflight.take() {
            token.cancel();
        }
    }

    fn arm_request(&mut self) -> CancellationToken {
        self.cancel_inflight();
        let token = self.cancel.child_token();
        self.inflight = Some(token.clone());
        token
    }

    fn publish_metrics(&self, bytes: u64, duration: Duration, content_secs: Option<f64>) {
        let _ = self.metrics_tx.send(PipelineMetrics {
            track: self.track,
            sample: ThroughputSample {
                bytes,
                duration,
                at: Instant::now(),
                content_duration: content_secs.map(Duration::from_secs_f64),
            },
        });
    }
}

fn segment_error(error: &TransportError) -> PlayerError {
    let code = match error {
        TransportError::Net(_) => ErrorCode::SegmentFetchError,
        TransportError::Parse { .. } => ErrorCode::SegmentParseError,
    };
    PlayerError::network(code, error.to_string(), false)
}

/// Map a manifest transport failure into the engine catalog.
#[must_use]
pub fn manifest_error(error: &TransportError, fatal: bool) -> PlayerError {
    let code = match error {
        TransportError::Net(_) => ErrorCode::ManifestFetchError,
        TransportError::Parse { .. } => ErrorCode::ManifestParseError,
    };
    PlayerError::network(code, error.to_string(), fatal)
}
