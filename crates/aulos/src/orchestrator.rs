//! Stream orchestrator.
//!
//! Top-level composition: opens the surface, fetches the manifest under the
//! retry harness, provisions sinks, spawns per-(period, track) adaptation
//! buffers and merges their lifecycles — together with timing, speed,
//! stalls and content protection — into the host-facing event stream.
//!
//! One orchestrator may be active per process at a time (most platforms
//! allow a single CDM per element); this is asserted at start, not hidden.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aulos_abr::AbrCoordinator;
use aulos_drm::{Cdm, DriverState, DrmError, ProtectionDriver};
use aulos_events::{ErrorCode, EventBus, StreamEvent, TimeRange, TrackType};
use aulos_net::Retryer;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use web_time::Instant;

use crate::buffer::{AdaptationBuffer, BufferConfig, BufferEvent, BufferParams};
use crate::element::{ElementEvent, MediaElement};
use crate::errors::{PlayerError, PlayerResult};
use crate::ledger::SegmentLedger;
use crate::manifest::{Manifest, Period, MAX_SOURCE_DURATION};
use crate::options::{PlayerOptions, StartAt};
use crate::pipeline::{manifest_error, PipelineMetrics, SegmentPipeline, Transport, TransportError};
use crate::surface::{MediaSink, Surface};
use crate::text::{NullRenderer, TextSink};
use crate::timing::{TimingSource, TimingsTick};

/// Offset used to look up the period following a finished one.
const NEXT_PERIOD_EPSILON: f64 = 2.0;

/// Distance kept behind the live edge when no start position is given.
const LIVE_EDGE_DELAY_SECS: f64 = 10.0;

/// Process-wide single-orchestrator sentinel.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// User intents routed into the running orchestrator.
enum Control {
    SelectAdaptation {
        track: TrackType,
        adaptation_id: Option<String>,
    },
}

/// Shared knobs reachable from the handle while playback runs.
struct SharedControls {
    abrs: Mutex<HashMap<TrackType, Arc<Mutex<AbrCoordinator>>>>,
    speed_tx: watch::Sender<f64>,
    control_tx: mpsc::Sender<Control>,
    element: Arc<dyn MediaElement>,
}

/// Handle to a running playback.
///
/// Completion is signalled by the event stream ending: the last event is
/// either `Fatal` or — for a normal end of play — the channel simply
/// closes once the orchestrator returns.
pub struct PlayerHandle {
    bus: EventBus,
    cancel: CancellationToken,
    shared: Arc<SharedControls>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerHandle").finish_non_exhaustive()
    }
}

impl PlayerHandle {
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.bus.subscribe()
    }

    /// Request teardown.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Change the playback speed. Applied immediately unless stalled; a
    /// stall forces rate 0 and restores this value afterwards.
    pub fn set_speed(&self, rate: f64) {
        let _ = self.shared.speed_tx.send(rate);
    }

    pub fn seek(&self, time: f64) {
        self.shared.element.seek(time);
    }

    pub fn set_manual_bitrate(&self, track: TrackType, bitrate: Option<u64>) {
        if let Some(abr) = self.shared.abrs.lock().get(&track) {
            abr.lock().set_manual_bitrate(bitrate);
        }
    }

    pub fn set_throttle(&self, track: TrackType, bps: Option<u64>) {
        if let Some(abr) = self.shared.abrs.lock().get(&track) {
            abr.lock().set_throttle(bps);
        }
    }

    pub fn set_width_limit(&self, track: TrackType, width: Option<u32>) {
        if let Some(abr) = self.shared.abrs.lock().get(&track) {
            abr.lock().set_width_limit(width);
        }
    }

    /// Choose an adaptation for a track; `None` disposes the track.
    pub fn select_adaptation(&self, track: TrackType, adaptation_id: Option<String>) {
        let _ = self.shared.control_tx.try_send(Control::SelectAdaptation {
            track,
            adaptation_id,
        });
    }

    /// Wait for the orchestrator task to finish.
    pub async fn finished(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Entry point; see the module docs.
pub struct StreamOrchestrator;

impl StreamOrchestrator {
    /// Start a playback. Fails immediately — before any sink exists — on
    /// configuration errors and when another orchestrator is active.
    pub fn start(
        url: Url,
        element: Arc<dyn MediaElement>,
        transport: Arc<dyn Transport>,
        cdm: Option<Arc<dyn Cdm>>,
        options: PlayerOptions,
    ) -> PlayerResult<PlayerHandle> {
        if ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(PlayerError::other(
                "another orchestrator is already active in this process",
                true,
            ));
        }
        if let Err(error) = ProtectionDriver::validate(&options.key_systems) {
            ACTIVE.store(false, Ordering::SeqCst);
            return Err(PlayerError::encrypted(error));
        }

        let bus = EventBus::new(options.event_capacity);
        let cancel = CancellationToken::new();
        let (speed_tx, speed_rx) = watch::channel(options.initial_speed);
        let (control_tx, control_rx) = mpsc::channel(8);
        let shared = Arc::new(SharedControls {
            abrs: Mutex::new(HashMap::new()),
            speed_tx,
            control_tx,
            element: Arc::clone(&element),
        });

        let engine = Engine {
            url,
            element,
            transport,
            cdm,
            options,
            bus: bus.clone(),
            cancel: cancel.clone(),
            shared: Arc::clone(&shared),
        };
        let join = tokio::spawn(engine.run(speed_rx, control_rx));

        Ok(PlayerHandle {
            bus,
            cancel,
            shared,
            join: Some(join),
        })
    }
}

struct TrackState {
    period_id: String,
    adaptation_id: String,
    cancel: CancellationToken,
}

struct Engine {
    url: Url,
    element: Arc<dyn MediaElement>,
    transport: Arc<dyn Transport>,
    cdm: Option<Arc<dyn Cdm>>,
    options: PlayerOptions,
    bus: EventBus,
    cancel: CancellationToken,
    shared: Arc<SharedControls>,
}

/// Everything owned for the duration of one playback.
struct Session {
    surface: Surface,
    manifest: Manifest,
    clock: watch::Receiver<TimingsTick>,
    buffer_tx: mpsc::Sender<BufferEvent>,
    metrics_tx: broadcast::Sender<PipelineMetrics>,
    append_gate_tx: watch::Sender<bool>,
    /// Per-track bookkeepers, constructed on first use.
    ledgers: HashMap<TrackType, Arc<Mutex<SegmentLedger>>>,
    tracks: HashMap<TrackType, TrackState>,
    text_sinks: HashMap<TrackType, Arc<TextSink>>,
    loaded_pending: HashSet<TrackType>,
    loaded_fired: bool,
    stalled: bool,
    current_speed: f64,
    last_refresh_at: Option<Instant>,
    protection: Option<ProtectionDriver>,
}

impl Engine {
    async fn run(
        mut self,
        speed_rx: watch::Receiver<f64>,
        control_rx: mpsc::Receiver<Control>,
    ) {
        match self.run_inner(speed_rx, control_rx).await {
            Ok(()) => debug!("playback completed"),
            Err(error) => {
                warn!(%error, "playback terminated");
                self.bus.publish(StreamEvent::Fatal(error.report()));
            }
        }
        // Child tokens (clock, buffers, overlay refresh, metrics feed) die
        // with the root token.
        self.cancel.cancel();
        ACTIVE.store(false, Ordering::SeqCst);
    }

    async fn run_inner(
        &mut self,
        speed_rx: watch::Receiver<f64>,
        control_rx: mpsc::Receiver<Control>,
    ) -> PlayerResult<()> {
        // 1. Open the surface. `Session` keeps it; teardown runs on every
        //    exit path below.
        let surface = Surface::open(
            Arc::clone(&self.element),
            &self.url,
            self.options.with_media_source,
        )?;

        // 2-3. Manifest under the retry harness, source-open await, then
        //      duration propagation.
        let manifest = self.fetch_initial_manifest().await?;
        surface.wait_source_open().await?;
        surface.set_duration(manifest.duration());
        self.bus.publish(StreamEvent::ManifestChange {
            version: manifest.version(),
        });

        // 5-6. Initial position and the period containing it.
        let initial_time = resolve_start_at(&manifest, self.options.start_at);
        let first_period = manifest
            .period_for_time(initial_time)
            .ok_or_else(|| {
                PlayerError::media(
                    ErrorCode::MediaStartingTimeNotFound,
                    format!("no period contains the starting time {initial_time}"),
                    true,
                )
            })?
            .clone();

        let (buffer_tx, buffer_rx) = mpsc::channel(32);
        let (metrics_tx, metrics_rx) = broadcast::channel(64);
        let (append_gate_tx, _) = watch::channel(true);

        let mut session = Session {
            surface,
            manifest,
            clock: TimingSource::spawn(Arc::clone(&self.element), self.cancel.child_token()),
            buffer_tx,
            metrics_tx,
            append_gate_tx,
            ledgers: HashMap::new(),
            tracks: HashMap::new(),
            text_sinks: HashMap::new(),
            loaded_pending: HashSet::new(),
            loaded_fired: false,
            stalled: false,
            current_speed: self.options.initial_speed,
            last_refresh_at: None,
            protection: self.cdm.as_ref().map(|cdm| {
                ProtectionDriver::new(Arc::clone(cdm), self.options.license_retry.clone())
            }),
        };

        self.spawn_metrics_feed(metrics_rx);

        // 4. Native sinks for every native track type of the first period,
        //    before playback can reach HAVE_METADATA.
        let track_types = self.playable_tracks(&first_period);
        for track in &track_types {
            self.provision_sink(&mut session, *track, &first_period, true)?;
        }
        self.seed_supplementary_tracks(&mut session).await;

        self.element.seek(initial_time);

        // 7-8. One adaptation buffer per track of the first period.
        for track in &track_types {
            self.spawn_track(&mut session, *track, &first_period, None)?;
        }
        session.loaded_pending = track_types.iter().copied().collect();

        // 9-10. Merge everything until end of play or a fatal error.
        let result = self
            .event_loop(&mut session, buffer_rx, speed_rx, control_rx)
            .await;

        // Scoped teardown, on success and failure alike.
        for state in session.tracks.values() {
            state.cancel.cancel();
        }
        if let Some(mut protection) = session.protection.take() {
            protection
                .dispose(self.options.should_unset_media_keys)
                .await;
        }
        session.surface.teardown();
        result
    }

    async fn fetch_initial_manifest(&self) -> PlayerResult<Manifest> {
        let mut retryer = Retryer::new(self.options.startup_retry.clone());
        let cancel = self.cancel.child_token();
        let bus = self.bus.clone();
        let transport = Arc::clone(&self.transport);
        let url = self.url.clone();
        retryer
            .run(
                || {
                    let transport = Arc::clone(&transport);
                    let url = url.clone();
                    let cancel = cancel.clone();
                    async move { transport.load_manifest(&url, &cancel).await }
                },
                TransportError::is_retryable,
                |error, attempt| {
                    debug!(%error, attempt, "manifest fetch retry");
                    bus.publish(StreamEvent::Warning(manifest_error(error, false).report()));
                },
                |error, _| error,
            )
            .await
            .map_err(|error| manifest_error(&error, true))
    }

    async fn event_loop(
        &self,
        session: &mut Session,
        mut buffer_rx: mpsc::Receiver<BufferEvent>,
        mut speed_rx: watch::Receiver<f64>,
        mut control_rx: mpsc::Receiver<Control>,
    ) -> PlayerResult<()> {
        let cancel = self.cancel.clone();
        let mut clock = session.clock.clone();
        let mut element_events = self.element.events();

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),

                event = buffer_rx.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    self.handle_buffer_event(session, event).await?;
                }

                changed = clock.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let tick = clock.borrow().clone();
                    if self.handle_tick(session, &tick) {
                        return Ok(());
                    }
                }

                element_event = element_events.recv() => match element_event {
                    Ok(ElementEvent::Encrypted { init_data_type, init_data }) => {
                        self.handle_encrypted(session, &init_data_type, &init_data).await?;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },

                changed = speed_rx.changed() => {
                    if changed.is_ok() {
                        let rate = *speed_rx.borrow();
                        self.apply_speed(session, rate);
                    }
                }

                control = control_rx.recv() => {
                    if let Some(control) = control {
                        self.handle_control(session, control);
                    }
                }
            }
        }
    }

    async fn handle_buffer_event(
        &self,
        session: &mut Session,
        event: BufferEvent,
    ) -> PlayerResult<()> {
        match event {
            BufferEvent::SegmentQueued { .. } => {}
            BufferEvent::RepresentationChanged {
                track,
                representation_id,
                bitrate,
            } => {
                self.bus.publish(StreamEvent::RepresentationChange {
                    track,
                    representation_id,
                    bitrate,
                });
            }
            BufferEvent::Warning { error, .. } => {
                if error.is_fatal() {
                    return Err(error);
                }
                self.bus.publish(StreamEvent::Warning(error.report()));
            }
            BufferEvent::NeedsManifestRefresh { .. } => {
                self.maybe_refresh(session).await;
            }
            BufferEvent::Filled { track, range } => {
                self.bus.publish(StreamEvent::BufferFilled { track, range });
                self.note_track_ready(session, track).await?;
                self.transition_or_warn(session, track, range)?;
            }
            BufferEvent::Finished { track, range } => {
                self.bus
                    .publish(StreamEvent::BufferFinished { track, range });
                self.note_track_ready(session, track).await?;
                self.transition_or_warn(session, track, range)?;
            }
        }
        Ok(())
    }

    /// End-of-play detection plus stall/speed management. Returns true when
    /// playback is complete.
    fn handle_tick(&self, session: &mut Session, tick: &TimingsTick) -> bool {
        if tick.duration.is_finite()
            && tick.duration > 0.0
            && tick.duration < MAX_SOURCE_DURATION
            && tick.duration - tick.current_time < self.options.end_of_play
        {
            debug!(
                current_time = tick.current_time,
                duration = tick.duration,
                "end of play reached"
            );
            session.surface.end_of_stream();
            return true;
        }

        if session.loaded_fired && tick.stalled != session.stalled {
            session.stalled = tick.stalled;
            self.bus.publish(StreamEvent::Stalled {
                stalled: tick.stalled,
            });
            // A stall freezes the effective rate; recovery restores the
            // user-chosen speed.
            if tick.stalled {
                self.element.set_playback_rate(0.0);
            } else {
                self.element.set_playback_rate(session.current_speed);
            }
        }
        false
    }

    fn apply_speed(&self, session: &mut Session, rate: f64) {
        session.current_speed = rate;
        if !session.stalled {
            self.element.set_playback_rate(rate);
        }
        self.bus.publish(StreamEvent::Speed { rate });
    }

    async fn note_track_ready(&self, session: &mut Session, track: TrackType) -> PlayerResult<()> {
        if session.loaded_fired {
            return Ok(());
        }
        session.loaded_pending.remove(&track);
        if !session.loaded_pending.is_empty() {
            return Ok(());
        }
        session.loaded_fired = true;
        self.bus.publish(StreamEvent::Loaded);
        self.element.set_playback_rate(session.current_speed);
        self.bus.publish(StreamEvent::Speed {
            rate: session.current_speed,
        });
        if self.options.auto_play {
            self.element.play().await?;
        }
        Ok(())
    }

    /// Like [`Self::maybe_transition`], but only fatal errors terminate.
    fn transition_or_warn(
        &self,
        session: &mut Session,
        track: TrackType,
        range: TimeRange,
    ) -> PlayerResult<()> {
        match self.maybe_transition(session, track, range) {
            Ok(()) => Ok(()),
            Err(error) if error.is_fatal() => Err(error),
            Err(error) => {
                self.bus.publish(StreamEvent::Warning(error.report()));
                Ok(())
            }
        }
    }

    /// Spawn the successor-period buffer once a track covered its period.
    fn maybe_transition(
        &self,
        session: &mut Session,
        track: TrackType,
        range: TimeRange,
    ) -> PlayerResult<()> {
        let Some(state) = session.tracks.get(&track) else {
            return Ok(());
        };
        let current_id = state.period_id.clone();
        let Some(current) = session
            .manifest
            .periods()
            .iter()
            .find(|p| p.id == current_id)
        else {
            return Ok(());
        };
        let current_end = current.bounds(session.manifest.duration()).end;

        let next = if range.end >= current_end - 1e-6 {
            session
                .manifest
                .period_for_time(range.end + NEXT_PERIOD_EPSILON)
        } else if range.end <= current.start + 1e-6 {
            // The playhead left the period backwards (seek).
            session.manifest.period_for_time(range.start)
        } else {
            None
        }
        .cloned();

        let Some(next) = next else { return Ok(()) };
        if next.id == current_id {
            return Ok(());
        }
        debug!(%track, from = %current_id, to = %next.id, "period transition");
        self.spawn_track(session, track, &next, None)
    }

    /// Throttled live refresh; merges in place and republishes duration.
    async fn maybe_refresh(&self, session: &mut Session) {
        if !session.manifest.is_live {
            return;
        }
        let now = Instant::now();
        if session
            .last_refresh_at
            .is_some_and(|t| now.duration_since(t) < self.options.live_refresh_min_interval)
        {
            return;
        }
        session.last_refresh_at = Some(now);

        let cancel = self.cancel.child_token();
        match self.transport.load_manifest(&self.url, &cancel).await {
            Ok(refreshed) => {
                if session.manifest.update(refreshed) {
                    session.surface.set_duration(session.manifest.duration());
                    self.bus.publish(StreamEvent::ManifestUpdate {
                        version: session.manifest.version(),
                    });
                    // Buffers hold period snapshots; respawn them over the
                    // merged manifest so new segments become visible.
                    let tracks: Vec<(TrackType, String)> = session
                        .tracks
                        .iter()
                        .map(|(track, state)| (*track, state.period_id.clone()))
                        .collect();
                    for (track, period_id) in tracks {
                        let period = session
                            .manifest
                            .periods()
                            .iter()
                            .find(|p| p.id == period_id)
                            .cloned();
                        if let Some(period) = period {
                            if let Err(error) = self.spawn_track(session, track, &period, None) {
                                self.bus.publish(StreamEvent::Warning(error.report()));
                            }
                        }
                    }
                }
            }
            Err(error) => {
                self.bus
                    .publish(StreamEvent::Warning(manifest_error(&error, false).report()));
            }
        }
    }

    async fn handle_encrypted(
        &self,
        session: &mut Session,
        init_data_type: &str,
        init_data: &Bytes,
    ) -> PlayerResult<()> {
        let Some(protection) = session.protection.as_mut() else {
            return Err(PlayerError::encrypted(DrmError::IncompatibleKeySystems));
        };
        if self.options.key_systems.is_empty() {
            return Err(PlayerError::encrypted(DrmError::IncompatibleKeySystems));
        }

        // Gate appends until the driver is configured again.
        let _ = session.append_gate_tx.send(false);
        let result = protection
            .handle_encrypted(&self.options.key_systems, init_data_type, init_data)
            .await;
        let open = matches!(
            protection.state(),
            DriverState::Configured | DriverState::Sessioned
        );
        let _ = session.append_gate_tx.send(open);

        match result {
            Ok(outcome) => {
                debug!(?outcome, "encrypted event handled");
                Ok(())
            }
            Err(error) => {
                let wrapped = PlayerError::encrypted(error);
                if wrapped.is_fatal() {
                    return Err(wrapped);
                }
                self.bus.publish(StreamEvent::Warning(wrapped.report()));
                Ok(())
            }
        }
    }

    fn handle_control(&self, session: &mut Session, control: Control) {
        match control {
            Control::SelectAdaptation {
                track,
                adaptation_id: None,
            } => {
                if let Some(state) = session.tracks.remove(&track) {
                    state.cancel.cancel();
                }
                session.surface.remove_sink(track);
                session.text_sinks.remove(&track);
                self.bus.publish(StreamEvent::AdaptationChange {
                    track,
                    adaptation_id: None,
                });
                debug!(%track, "track disposed");
            }
            Control::SelectAdaptation {
                track,
                adaptation_id: Some(id),
            } => {
                let period = session
                    .tracks
                    .get(&track)
                    .and_then(|state| {
                        session
                            .manifest
                            .periods()
                            .iter()
                            .find(|p| p.id == state.period_id)
                    })
                    .cloned();
                if let Some(period) = period {
                    if let Err(error) = self.spawn_track(session, track, &period, Some(&id)) {
                        self.bus.publish(StreamEvent::Warning(error.report()));
                    }
                }
            }
        }
    }

    /// Track types of `period` the engine will actually feed.
    fn playable_tracks(&self, period: &Period) -> Vec<TrackType> {
        period
            .track_types()
            .into_iter()
            .filter(|track| {
                if track.is_native() {
                    // Without a source extension the element streams `src`
                    // directly; there is nothing to feed.
                    self.options.with_media_source
                } else {
                    true
                }
            })
            .collect()
    }

    fn provision_sink(
        &self,
        session: &mut Session,
        track: TrackType,
        period: &Period,
        initial: bool,
    ) -> PlayerResult<Arc<dyn MediaSink>> {
        let adaptation = period.adaptations_of(track).first().ok_or_else(|| {
            PlayerError::media(
                ErrorCode::MediaSourceOpenError,
                format!("period {} has no {track} adaptation", period.id),
                true,
            )
        })?;
        let representation = adaptation.representations.first().ok_or_else(|| {
            PlayerError::media(
                ErrorCode::MediaSourceOpenError,
                format!("adaptation {} is empty", adaptation.id),
                true,
            )
        })?;

        if track.is_native() {
            let sink_type = representation.sink_type();
            if initial {
                session.surface.add_native_sink(track, &sink_type)
            } else if session.surface.sink_type(track) == Some(sink_type.as_str()) {
                session.surface.sink(track).ok_or_else(|| {
                    PlayerError::media(
                        ErrorCode::MediaSourceOpenError,
                        format!("{track} sink disappeared"),
                        true,
                    )
                })
            } else {
                // Codec change across periods: retire the old sink.
                session.surface.replace_native_sink(track, &sink_type)
            }
        } else {
            let existing = session.text_sinks.get(&track).cloned();
            let sink = match existing {
                Some(sink) => sink,
                None => self.create_text_sink(session, track)?,
            };
            Ok(sink as Arc<dyn MediaSink>)
        }
    }

    fn create_text_sink(
        &self,
        session: &mut Session,
        track: TrackType,
    ) -> PlayerResult<Arc<TextSink>> {
        let renderer = self
            .options
            .text_track
            .as_ref()
            .map_or_else(|| Arc::new(NullRenderer) as _, |o| Arc::clone(&o.renderer));
        let sink = Arc::new(TextSink::new(
            renderer,
            self.options.overlay_refresh_interval_ms,
        ));
        sink.spawn_refresh(session.clock.clone(), self.cancel.child_token());
        session.text_sinks.insert(track, Arc::clone(&sink));
        session
            .surface
            .add_custom_sink(track, Arc::clone(&sink) as Arc<dyn MediaSink>)?;
        Ok(sink)
    }

    /// Feed manually supplied text/image tracks into custom sinks.
    async fn seed_supplementary_tracks(&self, session: &mut Session) {
        for supplementary in &self.options.supplementary_tracks {
            let track = supplementary.track;
            if track.is_native() {
                warn!(%track, "supplementary tracks must be text or image");
                continue;
            }
            let existing = session.text_sinks.get(&track).cloned();
            let sink = match existing {
                Some(sink) => sink,
                None => match self.create_text_sink(session, track) {
                    Ok(sink) => sink,
                    Err(error) => {
                        self.bus.publish(StreamEvent::Warning(error.report()));
                        continue;
                    }
                },
            };
            let range = TimeRange::new(
                supplementary.cues.first().map_or(0.0, |c| c.start),
                supplementary.cues.last().map_or(0.0, |c| c.end),
            );
            let payload = crate::pipeline::SegmentPayload {
                data: Bytes::new(),
                range,
                cues: supplementary.cues.clone(),
            };
            if let Err(error) = sink.append(payload).await {
                warn!(%track, %error, "failed to seed supplementary track");
            }
        }
    }

    /// Spawn the adaptation buffer of `track` for `period`, retiring any
    /// previous buffer of that track.
    fn spawn_track(
        &self,
        session: &mut Session,
        track: TrackType,
        period: &Period,
        adaptation_id: Option<&str>,
    ) -> PlayerResult<()> {
        let adaptations = period.adaptations_of(track);
        let adaptation = match adaptation_id {
            Some(id) => adaptations.iter().find(|a| a.id == id),
            None => adaptations.first(),
        }
        .ok_or_else(|| {
            PlayerError::media(
                ErrorCode::MediaSourceOpenError,
                format!("no matching {track} adaptation in period {}", period.id),
                false,
            )
        })?
        .clone();

        let changed_selection = session
            .tracks
            .get(&track)
            .is_none_or(|s| s.adaptation_id != adaptation.id || s.period_id != period.id);
        if let Some(previous) = session.tracks.remove(&track) {
            previous.cancel.cancel();
        }

        let sink = self.provision_sink(session, track, period, false)?;
        let ledger = Arc::clone(
            session
                .ledgers
                .entry(track)
                .or_insert_with(|| Arc::new(Mutex::new(SegmentLedger::new()))),
        );
        let abr = Arc::new(Mutex::new(AbrCoordinator::new(
            self.options.abr_options_for(track),
        )));
        self.shared.abrs.lock().insert(track, Arc::clone(&abr));

        let track_cancel = self.cancel.child_token();
        let pipeline = SegmentPipeline::new(
            track,
            Arc::clone(&self.transport),
            self.options.segment_retry.clone(),
            session.metrics_tx.clone(),
            track_cancel.clone(),
        );
        let buffer = AdaptationBuffer::new(BufferParams {
            track,
            period: period.clone(),
            adaptation: adaptation.clone(),
            presentation_end: session.manifest.duration(),
            is_live: session.manifest.is_live,
            sink,
            ledger,
            pipeline,
            abr,
            config: BufferConfig {
                wanted_buffer_ahead: self.options.wanted_buffer_ahead,
                max_buffer_ahead: self.options.max_buffer_ahead,
                max_buffer_behind: self.options.max_buffer_behind,
            },
            events: session.buffer_tx.clone(),
            clock: session.clock.clone(),
            append_gate: session.append_gate_tx.subscribe(),
            cancel: track_cancel.clone(),
        });
        tokio::spawn(buffer.run());

        if changed_selection {
            self.bus.publish(StreamEvent::AdaptationChange {
                track,
                adaptation_id: Some(adaptation.id.clone()),
            });
        }
        session.tracks.insert(
            track,
            TrackState {
                period_id: period.id.clone(),
                adaptation_id: adaptation.id,
                cancel: track_cancel,
            },
        );
        debug!(%track, period = %period.id, "track spawned");
        Ok(())
    }

    fn spawn_metrics_feed(&self, mut metrics_rx: broadcast::Receiver<PipelineMetrics>) {
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    received = metrics_rx.recv() => match received {
                        Ok(metrics) => {
                            let abr = shared.abrs.lock().get(&metrics.track).cloned();
                            if let Some(abr) = abr {
                                abr.lock().push_sample(metrics.sample);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

/// Resolve the initial position from the start-at policy.
fn resolve_start_at(manifest: &Manifest, start_at: Option<StartAt>) -> f64 {
    let first = manifest.first_period().map_or(0.0, |p| p.start);
    let edge = live_edge(manifest);

    let resolved = match start_at {
        None => {
            if manifest.is_live {
                (edge - LIVE_EDGE_DELAY_SECS).max(first)
            } else {
                first
            }
        }
        // The engine timeline is anchored at the availability start, so
        // wall-clock positions coincide with absolute ones.
        Some(StartAt::Position(p) | StartAt::WallClockTime(p)) => p,
        Some(StartAt::FromFirstPosition(offset)) => first + offset.max(0.0),
        Some(StartAt::FromLastPosition(offset)) => (edge - offset.max(0.0)).max(first),
        Some(StartAt::Percentage(pct)) => {
            let duration = manifest.duration();
            if duration < MAX_SOURCE_DURATION {
                first + (duration - first) * (pct.clamp(0.0, 100.0) / 100.0)
            } else {
                first
            }
        }
    };
    resolved.max(first)
}

/// Latest reachable position: the bounded manifest duration, else the end
/// of the last period that describes one.
fn live_edge(manifest: &Manifest) -> f64 {
    if manifest.duration() < MAX_SOURCE_DURATION {
        return manifest.duration();
    }
    manifest
        .periods()
        .iter()
        .rev()
        .find_map(Period::end)
        .unwrap_or(0.0)
}
