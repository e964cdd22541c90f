// Integration tests for the session coordinator
//
// Runs complete consultations over the loopback capabilities:
// - Join idempotency, cancellation and fatal transport failures
// - Camera/screen mutual exclusion across toggle sequences
// - Total cleanup on leave
// - Best-effort device acquisition
// - Remote subscription and display-name enrichment
// - Camera switching without republishing

use std::sync::Arc;
use std::time::Duration;

use telecare_rtc::loopback::{
    LoopbackDevices, LoopbackNetwork, LoopbackTransport, MemoryPresenceStore, ScreenBehaviour,
};
use telecare_rtc::{
    Capabilities, CoordinatorConfig, DeviceError, JoinError, MediaError, MediaKind, SessionCoordinator,
    SessionPhase, SubscriptionState, TrackHandle, TrackSource, TrackState,
};

struct Clinic {
    network: Arc<LoopbackNetwork>,
    store: Arc<MemoryPresenceStore>,
}

struct Participant {
    transport: Arc<LoopbackTransport>,
    devices: Arc<LoopbackDevices>,
    coordinator: SessionCoordinator,
}

impl Clinic {
    fn new() -> Self {
        Self {
            network: LoopbackNetwork::new(),
            store: Arc::new(MemoryPresenceStore::new()),
        }
    }

    fn participant(&self, devices: LoopbackDevices) -> Participant {
        self.participant_with(devices, CoordinatorConfig::default())
    }

    fn participant_with(&self, devices: LoopbackDevices, config: CoordinatorConfig) -> Participant {
        let transport = Arc::new(LoopbackTransport::new(self.network.clone()));
        let devices = Arc::new(devices);
        let coordinator = SessionCoordinator::new(
            config,
            Capabilities {
                transport: transport.clone(),
                devices: devices.clone(),
                presence: self.store.clone(),
            },
        );
        Participant {
            transport,
            devices,
            coordinator,
        }
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

fn camera_and_screen_published(tracks: &[TrackHandle]) -> bool {
    let published = |source| {
        tracks
            .iter()
            .any(|t| t.source() == source && t.state() == TrackState::Published)
    };
    published(TrackSource::Camera) && published(TrackSource::Screen)
}

#[tokio::test]
async fn test_concurrent_duplicate_join_is_idempotent() {
    let clinic = Clinic::new();
    let doc = clinic.participant(LoopbackDevices::new());

    let (first, second) = tokio::join!(
        doc.coordinator.join("appt-42".into(), "doc-1".into(), "Dr. Silva"),
        doc.coordinator.join("appt-42".into(), "doc-1".into(), "Dr. Silva"),
    );
    first.unwrap();
    second.unwrap();

    eventually("joined", || doc.coordinator.phase() == SessionPhase::Joined).await;
    assert_eq!(doc.transport.join_calls(), 1);
    assert_eq!(clinic.network.members(&"appt-42".into()).len(), 1);

    // A later duplicate is still a no-op
    doc.coordinator
        .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
        .await
        .unwrap();
    assert_eq!(doc.transport.join_calls(), 1);
}

#[tokio::test]
async fn test_camera_and_screen_never_published_together() {
    let clinic = Clinic::new();
    let doc = clinic.participant(LoopbackDevices::new().screen(ScreenBehaviour::WithAudio));
    doc.coordinator
        .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
        .await
        .unwrap();

    let steps: [(&str, bool); 10] = [
        ("screen", true),
        ("camera", false),
        ("camera", true),
        ("screen", true),
        ("screen", true),
        ("camera", false),
        ("screen", true),
        ("camera", true),
        ("screen", true),
        ("camera", true),
    ];

    for (toggle, enabled) in steps {
        match toggle {
            "screen" => {
                doc.coordinator.toggle_screen_share().await.unwrap();
            }
            _ => doc.coordinator.toggle_camera(enabled).await.unwrap(),
        }

        assert!(!camera_and_screen_published(&doc.devices.created_tracks()));
        let sources = doc.transport.published_sources();
        assert!(!(sources.contains(&TrackSource::Camera) && sources.contains(&TrackSource::Screen)));
    }

    assert_eq!(clinic.network.violations(), 0);
}

#[tokio::test]
async fn test_leave_releases_every_track() {
    let clinic = Clinic::new();
    let doc = clinic.participant(LoopbackDevices::new().cameras(2));
    doc.coordinator
        .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
        .await
        .unwrap();
    doc.coordinator.toggle_mic(false).await.unwrap();
    doc.coordinator.switch_camera().await.unwrap();
    doc.coordinator.toggle_screen_share().await.unwrap();

    doc.coordinator.leave().await;

    let created = doc.devices.created_tracks();
    assert!(created.len() >= 3);
    assert!(created.iter().all(TrackHandle::is_stopped));
    assert_eq!(doc.transport.leave_calls(), 1);
    assert_eq!(doc.coordinator.phase(), SessionPhase::Left);
    assert!(clinic.network.members(&"appt-42".into()).is_empty());

    let snapshot = doc.coordinator.snapshot();
    assert!(snapshot.remotes.is_empty());
    assert!(snapshot.local.mic.is_none());
    assert!(!snapshot.local.screen_active);
}

#[tokio::test]
async fn test_leave_cleans_up_despite_failures() {
    let clinic = Clinic::new();
    let doc = clinic.participant(LoopbackDevices::new());
    doc.coordinator
        .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
        .await
        .unwrap();

    doc.transport
        .fail_leave(MediaError::Transport("socket closed".into()));
    clinic.store.set_failing(true);

    doc.coordinator.leave().await;

    assert_eq!(doc.coordinator.phase(), SessionPhase::Left);
    assert!(doc.devices.created_tracks().iter().all(TrackHandle::is_stopped));
    assert_eq!(doc.transport.leave_calls(), 1);
}

#[tokio::test]
async fn test_camera_failure_degrades_to_audio_only() {
    let clinic = Clinic::new();
    let pat = clinic.participant(LoopbackDevices::new().camera_denied());

    pat.coordinator
        .join("appt-42".into(), "pat-2".into(), "Ana")
        .await
        .unwrap();

    let local = pat.coordinator.snapshot().local;
    assert_eq!(pat.coordinator.phase(), SessionPhase::Joined);
    assert!(local.mic.is_some());
    assert!(local.camera.is_none());
    assert_eq!(pat.transport.published_sources(), vec![TrackSource::Microphone]);
}

#[tokio::test]
async fn test_no_devices_still_joins() {
    let clinic = Clinic::new();
    let pat = clinic.participant(LoopbackDevices::new().camera_denied().without_microphone());

    pat.coordinator
        .join("appt-42".into(), "pat-2".into(), "Ana")
        .await
        .unwrap();

    assert_eq!(pat.coordinator.phase(), SessionPhase::Joined);
    assert_eq!(pat.transport.publish_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_device_timeout_is_non_fatal() {
    let clinic = Clinic::new();
    let config = CoordinatorConfig {
        device_timeout: Duration::from_millis(100),
        ..CoordinatorConfig::default()
    };
    let pat = clinic.participant_with(
        LoopbackDevices::new().acquire_delay(Duration::from_secs(5)),
        config,
    );

    pat.coordinator
        .join("appt-42".into(), "pat-2".into(), "Ana")
        .await
        .unwrap();

    let local = pat.coordinator.snapshot().local;
    assert_eq!(pat.coordinator.phase(), SessionPhase::Joined);
    assert!(local.mic.is_none());
    assert!(local.camera.is_none());
}

#[tokio::test]
async fn test_display_name_arrives_after_media() {
    let clinic = Clinic::new();
    let doc = clinic.participant(LoopbackDevices::new());

    doc.coordinator
        .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
        .await
        .unwrap();

    // pat-2 announces to a store doc-1 is not watching
    let pat = {
        let elsewhere = Clinic {
            network: clinic.network.clone(),
            store: Arc::new(MemoryPresenceStore::new()),
        };
        elsewhere.participant(LoopbackDevices::new().camera_denied())
    };
    pat.coordinator
        .join("appt-42".into(), "pat-2".into(), "Ana")
        .await
        .unwrap();

    eventually("pat-2 audio subscribed", || {
        doc.coordinator
            .registry()
            .get(&"pat-2".into())
            .is_some_and(|p| p.audio == SubscriptionState::Subscribed)
    })
    .await;
    let before = doc.coordinator.registry().get(&"pat-2".into()).unwrap();
    assert_eq!(before.display_name, None);

    // The record reaches the watched store later
    let record = telecare_core::models::PresenceRecord::new(
        "appt-42".into(),
        "pat-2".into(),
        "Ana".into(),
    );
    telecare_rtc::PresenceStore::put(&*clinic.store, &record.key(), &record)
        .await
        .unwrap();

    eventually("pat-2 named", || {
        doc.coordinator
            .registry()
            .get(&"pat-2".into())
            .is_some_and(|p| p.display_name.as_deref() == Some("Ana"))
    })
    .await;
    let after = doc.coordinator.registry().get(&"pat-2".into()).unwrap();
    assert_eq!(after.audio, before.audio);
    assert_eq!(after.video, before.video);
}

#[tokio::test]
async fn test_switch_camera_keeps_published_track() {
    let clinic = Clinic::new();
    let doc = clinic.participant(LoopbackDevices::new().cameras(2));
    doc.coordinator
        .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
        .await
        .unwrap();
    assert!(doc.coordinator.has_multiple_cameras().await);

    let before = doc.coordinator.snapshot().local.camera.unwrap();
    let publishes = doc.transport.publish_calls();
    let unpublishes = doc.transport.unpublish_calls();

    let device = doc.coordinator.switch_camera().await.unwrap();
    assert_eq!(device.device_id, "cam-1");

    let after = doc.coordinator.snapshot().local.camera.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.state, TrackState::Published);
    assert_eq!(before.device_id.as_deref(), Some("cam-0"));
    assert_eq!(after.device_id.as_deref(), Some("cam-1"));
    assert_eq!(doc.transport.publish_calls(), publishes);
    assert_eq!(doc.transport.unpublish_calls(), unpublishes);

    // Wraps back to the first camera
    let device = doc.coordinator.switch_camera().await.unwrap();
    assert_eq!(device.device_id, "cam-0");
}

#[tokio::test]
async fn test_switch_camera_needs_two_devices() {
    let clinic = Clinic::new();
    let doc = clinic.participant(LoopbackDevices::new());
    doc.coordinator
        .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
        .await
        .unwrap();

    assert!(matches!(
        doc.coordinator.switch_camera().await,
        Err(DeviceError::SingleDeviceOnly { available: 1 })
    ));
}

#[tokio::test]
async fn test_consultation_scenario() {
    let clinic = Clinic::new();
    let doc = clinic.participant(LoopbackDevices::new());
    let pat = clinic.participant(LoopbackDevices::new().camera_denied());

    doc.coordinator
        .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
        .await
        .unwrap();
    pat.coordinator
        .join("appt-42".into(), "pat-2".into(), "Ana")
        .await
        .unwrap();

    eventually("doc sees pat-2 audio", || {
        doc.coordinator
            .registry()
            .get(&"pat-2".into())
            .is_some_and(|p| p.audio == SubscriptionState::Subscribed)
    })
    .await;
    let pat_entry = doc.coordinator.registry().get(&"pat-2".into()).unwrap();
    assert_eq!(pat_entry.video, SubscriptionState::Unsubscribed);

    eventually("pat sees doc-1 audio and video", || {
        pat.coordinator
            .registry()
            .get(&"doc-1".into())
            .is_some_and(|p| {
                p.audio == SubscriptionState::Subscribed && p.video == SubscriptionState::Subscribed
            })
    })
    .await;
    eventually("names from presence", || {
        doc.coordinator
            .registry()
            .get(&"pat-2".into())
            .and_then(|p| p.display_name)
            .as_deref()
            == Some("Ana")
    })
    .await;
    assert_eq!(doc.coordinator.participant_count(), 2);

    // Screen share replaces the camera
    assert!(doc.coordinator.toggle_screen_share().await.unwrap());
    let local = doc.coordinator.snapshot().local;
    assert!(local.screen_active);
    assert!(local.camera_enabled);
    let sources = doc.transport.published_sources();
    assert!(sources.contains(&TrackSource::Screen));
    assert!(!sources.contains(&TrackSource::Camera));

    // Stopping it brings the camera back
    assert!(!doc.coordinator.toggle_screen_share().await.unwrap());
    let sources = doc.transport.published_sources();
    assert!(sources.contains(&TrackSource::Camera));
    assert!(!sources.contains(&TrackSource::Screen));
    eventually("pat still sees doc-1 video", || {
        pat.coordinator
            .registry()
            .get(&"doc-1".into())
            .is_some_and(|p| p.video == SubscriptionState::Subscribed)
    })
    .await;

    // Patient leaves
    pat.coordinator.leave().await;
    eventually("pat-2 departed", || {
        doc.coordinator.registry().get(&"pat-2".into()).is_none()
    })
    .await;
    assert!(clinic
        .store
        .record(&telecare_core::models::PresenceKey::new(
            "appt-42".into(),
            "pat-2".into()
        ))
        .is_none());

    doc.coordinator.leave().await;
    assert_eq!(clinic.network.room_count(), 0);
    assert!(clinic.store.records(&"appt-42".into()).is_empty());
}

#[tokio::test]
async fn test_leave_cancels_pending_join() {
    let clinic = Clinic::new();
    let doc = clinic.participant(LoopbackDevices::new());
    doc.transport.join_delay(Duration::from_millis(200));

    let joining = {
        let coordinator = doc.coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
                .await
        })
    };

    eventually("joining", || doc.coordinator.phase() == SessionPhase::Joining).await;
    doc.coordinator.leave().await;

    let result = joining.await.unwrap();
    assert!(matches!(result, Err(JoinError::Cancelled)));
    assert_eq!(doc.coordinator.phase(), SessionPhase::Left);
    assert_eq!(doc.transport.join_calls(), 1);
    assert_eq!(doc.transport.leave_calls(), 1);
    assert!(doc.devices.created_tracks().is_empty());
    assert!(clinic.network.members(&"appt-42".into()).is_empty());
}

#[tokio::test]
async fn test_leave_during_device_acquisition_publishes_nothing() {
    let clinic = Clinic::new();
    let doc = clinic.participant(LoopbackDevices::new().acquire_delay(Duration::from_millis(300)));

    let joining = {
        let coordinator = doc.coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
                .await
        })
    };

    // Transport join is immediate; the devices are still being acquired
    eventually("joined", || doc.coordinator.phase() == SessionPhase::Joined).await;
    doc.coordinator.leave().await;

    let result = joining.await.unwrap();
    assert!(matches!(result, Err(JoinError::Cancelled)));
    assert_eq!(doc.coordinator.phase(), SessionPhase::Left);
    assert_eq!(doc.transport.publish_calls(), 0);
    assert_eq!(doc.transport.leave_calls(), 1);
    assert!(doc.devices.created_tracks().iter().all(TrackHandle::is_stopped));
    assert!(clinic.network.members(&"appt-42".into()).is_empty());
}

#[tokio::test]
async fn test_remote_subscribe_failure_then_retry() {
    let clinic = Clinic::new();
    let doc = clinic.participant(LoopbackDevices::new());
    let pat = clinic.participant(LoopbackDevices::new());

    doc.transport.fail_subscribe(MediaKind::Video);
    doc.coordinator
        .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
        .await
        .unwrap();
    pat.coordinator
        .join("appt-42".into(), "pat-2".into(), "Ana")
        .await
        .unwrap();

    eventually("pat-2 audio subscribed", || {
        doc.coordinator
            .registry()
            .get(&"pat-2".into())
            .is_some_and(|p| p.audio == SubscriptionState::Subscribed)
    })
    .await;
    assert_eq!(
        doc.coordinator.registry().get(&"pat-2".into()).unwrap().video,
        SubscriptionState::Unsubscribed
    );

    doc.transport.clear_subscribe_faults();
    doc.coordinator
        .resubscribe("pat-2".into(), MediaKind::Video)
        .await
        .unwrap();
    assert_eq!(
        doc.coordinator.registry().get(&"pat-2".into()).unwrap().video,
        SubscriptionState::Subscribed
    );

    let target = telecare_rtc::RenderTarget::remote_video(&"pat-2".into());
    doc.coordinator
        .play_remote(&"pat-2".into(), MediaKind::Video, &target)
        .unwrap();
}

#[tokio::test]
async fn test_presence_outage_does_not_block_media() {
    let clinic = Clinic::new();
    clinic.store.set_failing(true);
    let doc = clinic.participant(LoopbackDevices::new());

    doc.coordinator
        .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
        .await
        .unwrap();
    assert_eq!(doc.coordinator.phase(), SessionPhase::Joined);
    assert!(doc.coordinator.snapshot().local.camera.is_some());

    doc.coordinator.leave().await;
    assert_eq!(doc.coordinator.phase(), SessionPhase::Left);
}
