//! End-to-end playback scenarios over the scripted seams.

use std::sync::Arc;
use std::time::Duration;

use aulos::element::MediaElement;
use aulos::mock::{EchoLicense, MockCdm, MockMediaElement, ScriptedTransport};
use aulos::orchestrator::PlayerHandle;
use aulos::{PlayerOptions, StartAt, StreamEvent, StreamOrchestrator, TimeRange, TrackType};
use aulos_drm::KeySystemConfig;
use bytes::Bytes;
use tokio::sync::broadcast;
use url::Url;

/// One orchestrator may run per process; scenarios take turns.
static SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Honor `RUST_LOG` when debugging a scenario.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manifest_url() -> Url {
    Url::parse("https://example.com/content/manifest.mpd").expect("valid url")
}

fn widevine() -> KeySystemConfig {
    KeySystemConfig {
        key_system: "com.widevine.alpha".into(),
        license: Arc::new(EchoLicense),
        server_certificate: None,
        persistent_license: false,
        storage: None,
    }
}

async fn next_event(rx: &mut broadcast::Receiver<StreamEvent>) -> Option<StreamEvent> {
    loop {
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Ok(event)) => return Some(event),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            _ => return None,
        }
    }
}

/// Collect events until `Loaded` fires; panics if it never does.
async fn collect_until_loaded(rx: &mut broadcast::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await.expect("event stream alive");
        let loaded = matches!(event, StreamEvent::Loaded);
        seen.push(event);
        if loaded {
            return seen;
        }
    }
}

async fn shut_down(mut handle: PlayerHandle) {
    handle.stop();
    handle.finished().await;
}

#[tokio::test]
async fn vod_single_period_loads_and_buffers() {
    init_tracing();
    let _serial = SERIAL.lock().await;
    let element = Arc::new(MockMediaElement::new());
    let transport = Arc::new(ScriptedTransport::vod_single_period(60.0));

    let options = PlayerOptions::default()
        .with_auto_play(true)
        .with_start_at(StartAt::Position(0.0))
        .with_wanted_buffer_ahead(10.0);
    let handle = StreamOrchestrator::start(
        manifest_url(),
        element.clone(),
        transport.clone(),
        None,
        options,
    )
    .unwrap();
    let mut events = handle.events();

    let seen = collect_until_loaded(&mut events).await;

    // Speed settles at 1.0 right after Loaded; drain it.
    let speed = next_event(&mut events).await.expect("speed event");
    assert!(matches!(speed, StreamEvent::Speed { rate } if (rate - 1.0).abs() < f64::EPSILON));

    // Both tracks filled their wanted range and the sink agrees.
    for track in [TrackType::Audio, TrackType::Video] {
        assert!(
            seen.iter().any(|e| matches!(
                e,
                StreamEvent::BufferFilled { track: t, range } if *t == track && range.end >= 10.0 - 1e-6
            )),
            "{track} must fill [0, 10)"
        );
    }
    assert_eq!(element.buffered(), vec![TimeRange::new(0.0, 10.0)]);

    // Exactly one native sink per native track type.
    let media_source = element.media_source().expect("media source attached");
    assert_eq!(media_source.buffer_count(), 2);

    // Loaded fired exactly once, playback started, and nothing stalled.
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, StreamEvent::Loaded))
            .count(),
        1
    );
    assert!(!element.paused(), "auto-play must start the element");
    assert!(
        !seen.iter().any(|e| matches!(e, StreamEvent::Stalled { .. })),
        "no stall events in a healthy start-up"
    );

    shut_down(handle).await;
}

#[tokio::test(start_paused = true)]
async fn abr_downshift_sticks_to_the_sustainable_rung() {
    init_tracing();
    let _serial = SERIAL.lock().await;
    let element = Arc::new(MockMediaElement::new());
    let transport = Arc::new(ScriptedTransport::vod_video_ladder(
        60.0,
        &[500_000, 3_000_000],
    ));
    // The modeled network sustains 800 kbps.
    transport.set_throughput(Some(800_000));

    let options = PlayerOptions::default()
        .with_start_at(StartAt::Position(0.0))
        .with_wanted_buffer_ahead(10.0);
    let handle = StreamOrchestrator::start(
        manifest_url(),
        element.clone(),
        transport.clone(),
        None,
        options,
    )
    .unwrap();
    let mut events = handle.events();

    let seen = collect_until_loaded(&mut events).await;

    let changes: Vec<u64> = seen
        .iter()
        .filter_map(|e| match e {
            StreamEvent::RepresentationChange { bitrate, .. } => Some(*bitrate),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec![500_000], "one change, to the 500k rung");

    shut_down(handle).await;
}

#[tokio::test]
async fn seek_across_periods_retires_and_respawns_buffers() {
    init_tracing();
    let _serial = SERIAL.lock().await;
    let element = Arc::new(MockMediaElement::new());
    let transport = Arc::new(ScriptedTransport::two_periods(30.0, 30.0));

    let options = PlayerOptions::default()
        .with_start_at(StartAt::Position(0.0))
        .with_wanted_buffer_ahead(10.0);
    let handle = StreamOrchestrator::start(
        manifest_url(),
        element.clone(),
        transport.clone(),
        None,
        options,
    )
    .unwrap();
    let mut events = handle.events();
    collect_until_loaded(&mut events).await;

    transport.clear_segment_times();
    handle.seek(45.0);

    // Period-2 buffers spawn for both tracks and fill around the playhead.
    let mut p2_adaptations = 0;
    let mut p2_filled = 0;
    while p2_adaptations < 2 || p2_filled < 2 {
        match next_event(&mut events).await.expect("event stream alive") {
            StreamEvent::AdaptationChange {
                adaptation_id: Some(id),
                ..
            } if id.starts_with("p2-") => p2_adaptations += 1,
            StreamEvent::BufferFilled { range, .. } if range.start >= 30.0 => p2_filled += 1,
            _ => {}
        }
    }

    // Nothing belonging to period 1 was fetched after the seek settled.
    let times = transport.segment_times();
    assert!(!times.is_empty());
    assert!(
        times.iter().all(|t| *t >= 30.0),
        "no period-1 segment after the seek: {times:?}"
    );

    shut_down(handle).await;
}

#[tokio::test]
async fn live_refresh_extends_the_manifest() {
    init_tracing();
    let _serial = SERIAL.lock().await;
    let element = Arc::new(MockMediaElement::new());
    let transport = Arc::new(ScriptedTransport::live(60.0));

    let mut options = PlayerOptions::default().with_wanted_buffer_ahead(10.0);
    options.live_refresh_min_interval = Duration::ZERO;
    let handle = StreamOrchestrator::start(
        manifest_url(),
        element.clone(),
        transport.clone(),
        None,
        options,
    )
    .unwrap();
    let mut events = handle.events();
    collect_until_loaded(&mut events).await;

    // The next refresh sees a stream that grew past the old edge.
    transport.extend_live(80.0);

    let mut updated = None;
    for _ in 0..256 {
        match next_event(&mut events).await.expect("event stream alive") {
            StreamEvent::ManifestUpdate { version } => {
                updated = Some(version);
                break;
            }
            _ => {}
        }
    }
    let version = updated.expect("live edge triggers a manifest update");
    assert!(version >= 1);
    assert!(
        transport.manifest_load_count() >= 2,
        "initial fetch plus at least one refresh"
    );

    shut_down(handle).await;
}

#[tokio::test]
async fn encrypted_first_play_reaches_sessioned() {
    init_tracing();
    let _serial = SERIAL.lock().await;
    let element = Arc::new(MockMediaElement::new());
    let transport = Arc::new(ScriptedTransport::vod_single_period(60.0));
    let cdm = Arc::new(MockCdm::accepting(&["com.widevine.alpha"]));

    let options = PlayerOptions::default()
        .with_start_at(StartAt::Position(0.0))
        .with_wanted_buffer_ahead(10.0)
        .with_key_systems(vec![widevine()]);
    let handle = StreamOrchestrator::start(
        manifest_url(),
        element.clone(),
        transport.clone(),
        Some(cdm.clone()),
        options,
    )
    .unwrap();
    let mut events = handle.events();
    collect_until_loaded(&mut events).await;

    element.fire(aulos::element::ElementEvent::Encrypted {
        init_data_type: "cenc".into(),
        init_data: Bytes::from_static(b"init-data"),
    });

    // The session is licensed; no fatal event interrupts playback.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let ops = cdm.ops();
        if ops.iter().any(|op| op.starts_with("update:")) {
            assert!(ops.contains(&"attach".to_string()));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "session never licensed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shut_down(handle).await;
}

#[tokio::test]
async fn persistent_license_without_storage_fails_before_any_sink() {
    init_tracing();
    let _serial = SERIAL.lock().await;
    let element = Arc::new(MockMediaElement::new());
    let transport = Arc::new(ScriptedTransport::vod_single_period(60.0));
    let cdm = Arc::new(MockCdm::accepting(&["com.widevine.alpha"]));

    let mut config = widevine();
    config.persistent_license = true;
    let options = PlayerOptions::default().with_key_systems(vec![config]);

    let error = StreamOrchestrator::start(
        manifest_url(),
        element.clone(),
        transport,
        Some(cdm),
        options,
    )
    .unwrap_err();

    assert_eq!(error.code(), aulos::ErrorCode::InvalidKeySystem);
    assert!(error.is_fatal());
    // Start-up failed before the element was touched.
    assert!(element.src().is_none());
    assert!(element.media_source().is_none());
}

#[tokio::test]
async fn end_of_play_completes_the_stream() {
    init_tracing();
    let _serial = SERIAL.lock().await;
    let element = Arc::new(MockMediaElement::new());
    let transport = Arc::new(ScriptedTransport::vod_single_period(30.0));

    let options = PlayerOptions::default()
        .with_start_at(StartAt::Position(0.0))
        .with_wanted_buffer_ahead(5.0)
        .with_end_of_play(0.5);
    let mut handle = StreamOrchestrator::start(
        manifest_url(),
        element.clone(),
        transport,
        None,
        options,
    )
    .unwrap();
    let mut events = handle.events();
    collect_until_loaded(&mut events).await;

    // The playhead crosses duration - END_OF_PLAY.
    element.set_current_time(29.6);

    tokio::time::timeout(Duration::from_secs(5), handle.finished())
        .await
        .expect("orchestrator completes");

    // Teardown left the element in its pre-open state; the stream ends
    // without a Fatal event.
    assert!(element.src().is_none());
    assert!(element.revoked_attachments() >= 1);
    loop {
        match events.try_recv() {
            Ok(event) => assert!(
                !matches!(event, StreamEvent::Fatal(_)),
                "end of play is not an error"
            ),
            Err(broadcast::error::TryRecvError::Closed) => break,
            Err(broadcast::error::TryRecvError::Empty) => break,
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
        }
    }
}

#[tokio::test]
async fn second_orchestrator_in_the_same_process_is_rejected() {
    init_tracing();
    let _serial = SERIAL.lock().await;
    let element = Arc::new(MockMediaElement::new());
    let transport = Arc::new(ScriptedTransport::vod_single_period(60.0));

    let handle = StreamOrchestrator::start(
        manifest_url(),
        element.clone(),
        transport.clone(),
        None,
        PlayerOptions::default(),
    )
    .unwrap();

    let second = StreamOrchestrator::start(
        manifest_url(),
        Arc::new(MockMediaElement::new()),
        transport,
        None,
        PlayerOptions::default(),
    );
    assert!(second.is_err());

    shut_down(handle).await;
}
