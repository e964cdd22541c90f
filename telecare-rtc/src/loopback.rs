//! In-process capability implementations
//!
//! [`LoopbackNetwork`] routes publish and departure events between
//! participants joined through [`LoopbackTransport`]s, fanning each event
//! out to every other member of the room. Together with
//! [`LoopbackDevices`] and [`MemoryPresenceStore`] this runs a complete
//! consultation inside one process. Every piece records enough to assert
//! on afterwards and can be told to fail.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::DeviceProvider;
use crate::error::{MediaError, Result};
use crate::store::{PresenceChange, PresenceStore};
use crate::track::{MediaTrack, ScreenCapture, TrackHandle};
use crate::transport::{Transport, TransportEvent};
use crate::types::{DeviceDescriptor, MediaKind, RenderTarget, SessionIdentity, TrackSource};
use telecare_core::models::{ParticipantId, PresenceKey, PresenceRecord, RoomRecord, SessionId};

// ------------------------------------------------------------------------
// Tracks
// ------------------------------------------------------------------------

/// Media track that only records what was done to it
pub struct LoopbackTrack {
    kind: MediaKind,
    source: TrackSource,
    device: Mutex<Option<String>>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    closed: AtomicBool,
    played: Mutex<Vec<RenderTarget>>,
    ended: CancellationToken,
}

impl LoopbackTrack {
    /// Local track of `source`. Use [`LoopbackTrack::remote`] for received media.
    #[must_use]
    pub fn new(source: TrackSource) -> Self {
        Self::build(source.kind().unwrap_or(MediaKind::Video), source, None)
    }

    #[must_use]
    pub fn with_device(source: TrackSource, device_id: impl Into<String>) -> Self {
        Self::build(
            source.kind().unwrap_or(MediaKind::Video),
            source,
            Some(device_id.into()),
        )
    }

    #[must_use]
    pub fn remote(kind: MediaKind) -> Self {
        Self::build(kind, TrackSource::Remote, None)
    }

    fn build(kind: MediaKind, source: TrackSource, device: Option<String>) -> Self {
        Self {
            kind,
            source,
            device: Mutex::new(device),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            played: Mutex::new(Vec::new()),
            ended: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn played(&self) -> Vec<RenderTarget> {
        self.played.lock().clone()
    }

    /// Simulate the platform ending the capture (e.g. "stop sharing")
    pub fn end(&self) {
        self.ended.cancel();
    }
}

#[async_trait]
impl MediaTrack for LoopbackTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn source(&self) -> TrackSource {
        self.source
    }

    fn device_id(&self) -> Option<String> {
        self.device.lock().clone()
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        if self.is_stopped() {
            return Err(MediaError::TrackStopped);
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn set_device(&self, device: &DeviceDescriptor) -> Result<()> {
        if self.source != TrackSource::Camera {
            return Err(MediaError::Unsupported(format!(
                "{:?} track cannot change device",
                self.source
            )));
        }
        *self.device.lock() = Some(device.device_id.clone());
        Ok(())
    }

    fn play(&self, target: &RenderTarget) -> Result<()> {
        self.played.lock().push(target.clone());
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ended(&self) -> Option<BoxFuture<'static, ()>> {
        if self.source != TrackSource::Screen {
            return None;
        }
        Some(Box::pin(self.ended.clone().cancelled_owned()))
    }
}

// ------------------------------------------------------------------------
// Devices
// ------------------------------------------------------------------------

/// How [`LoopbackDevices`] answers a screen capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenBehaviour {
    VideoOnly,
    WithAudio,
    /// The user dismisses the picker
    Cancelled,
    Fail,
}

pub struct LoopbackDevices {
    cameras: RwLock<Vec<DeviceDescriptor>>,
    microphone: AtomicBool,
    camera_denied: AtomicBool,
    screen: Mutex<ScreenBehaviour>,
    acquire_delay: Mutex<Option<Duration>>,
    camera_acquisitions: AtomicUsize,
    created: Mutex<Vec<TrackHandle>>,
    screens: Mutex<Vec<Arc<LoopbackTrack>>>,
}

impl Default for LoopbackDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackDevices {
    /// One camera, a working microphone, video-only screen capture
    #[must_use]
    pub fn new() -> Self {
        Self {
            cameras: RwLock::new(camera_list(1)),
            microphone: AtomicBool::new(true),
            camera_denied: AtomicBool::new(false),
            screen: Mutex::new(ScreenBehaviour::VideoOnly),
            acquire_delay: Mutex::new(None),
            camera_acquisitions: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            screens: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn cameras(self, count: usize) -> Self {
        self.set_cameras(count);
        self
    }

    #[must_use]
    pub fn without_microphone(self) -> Self {
        self.set_microphone_available(false);
        self
    }

    #[must_use]
    pub fn camera_denied(self) -> Self {
        self.camera_denied.store(true, Ordering::SeqCst);
        self
    }

    #[must_use]
    pub fn screen(self, behaviour: ScreenBehaviour) -> Self {
        self.set_screen(behaviour);
        self
    }

    /// Every acquisition sleeps this long first
    #[must_use]
    pub fn acquire_delay(self, delay: Duration) -> Self {
        *self.acquire_delay.lock() = Some(delay);
        self
    }

    pub fn set_cameras(&self, count: usize) {
        *self.cameras.write() = camera_list(count);
    }

    pub fn set_microphone_available(&self, available: bool) {
        self.microphone.store(available, Ordering::SeqCst);
    }

    pub fn set_screen(&self, behaviour: ScreenBehaviour) {
        *self.screen.lock() = behaviour;
    }

    /// Every track handed out so far
    #[must_use]
    pub fn created_tracks(&self) -> Vec<TrackHandle> {
        self.created.lock().clone()
    }

    #[must_use]
    pub fn camera_acquisitions(&self) -> usize {
        self.camera_acquisitions.load(Ordering::SeqCst)
    }

    /// End the most recent screen capture from outside the application.
    /// Returns `false` when nothing was captured yet.
    pub fn end_screen_share(&self) -> bool {
        match self.screens.lock().last() {
            Some(track) => {
                track.end();
                true
            }
            None => false,
        }
    }

    fn hand_out(&self, track: LoopbackTrack) -> (TrackHandle, Arc<LoopbackTrack>) {
        let track = Arc::new(track);
        let handle = TrackHandle::new(track.clone());
        self.created.lock().push(handle.clone());
        (handle, track)
    }

    async fn delay(&self) {
        let delay = *self.acquire_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn camera_list(count: usize) -> Vec<DeviceDescriptor> {
    (0..count)
        .map(|i| DeviceDescriptor::new(format!("cam-{i}"), format!("Loopback Camera {i}")))
        .collect()
}

#[async_trait]
impl DeviceProvider for LoopbackDevices {
    async fn list_cameras(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.cameras.read().clone())
    }

    async fn acquire_microphone(&self) -> Result<TrackHandle> {
        self.delay().await;
        if !self.microphone.load(Ordering::SeqCst) {
            return Err(MediaError::NotFound("microphone".to_string()));
        }
        Ok(self.hand_out(LoopbackTrack::new(TrackSource::Microphone)).0)
    }

    async fn acquire_camera(&self, device: Option<DeviceDescriptor>) -> Result<TrackHandle> {
        self.delay().await;
        self.camera_acquisitions.fetch_add(1, Ordering::SeqCst);
        if self.camera_denied.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("camera".to_string()));
        }

        let device_id = {
            let cameras = self.cameras.read();
            match device {
                Some(device) => cameras
                    .iter()
                    .find(|c| c.device_id == device.device_id)
                    .map(|c| c.device_id.clone())
                    .ok_or_else(|| MediaError::NotFound(device.device_id.clone()))?,
                None => cameras
                    .first()
                    .map(|c| c.device_id.clone())
                    .ok_or_else(|| MediaError::NotFound("camera".to_string()))?,
            }
        };

        Ok(self
            .hand_out(LoopbackTrack::with_device(TrackSource::Camera, device_id))
            .0)
    }

    async fn acquire_screen(&self) -> Result<ScreenCapture> {
        self.delay().await;
        let behaviour = *self.screen.lock();
        match behaviour {
            ScreenBehaviour::Cancelled => Err(MediaError::Cancelled),
            ScreenBehaviour::Fail => Err(MediaError::PermissionDenied("screen".to_string())),
            ScreenBehaviour::VideoOnly => {
                let (video, raw) = self.hand_out(LoopbackTrack::new(TrackSource::Screen));
                self.screens.lock().push(raw);
                Ok(ScreenCapture::VideoOnly(video))
            }
            ScreenBehaviour::WithAudio => {
                let (video, raw) = self.hand_out(LoopbackTrack::new(TrackSource::Screen));
                self.screens.lock().push(raw);
                let (audio, _) = self.hand_out(LoopbackTrack::new(TrackSource::ScreenAudio));
                Ok(ScreenCapture::VideoAndAudio(video, audio))
            }
        }
    }
}

// ------------------------------------------------------------------------
// Network and transport
// ------------------------------------------------------------------------

struct Member {
    participant: ParticipantId,
    sender: Option<mpsc::UnboundedSender<TransportEvent>>,
    published: Vec<TrackHandle>,
}

impl Member {
    fn has_kind(&self, kind: MediaKind) -> bool {
        self.published.iter().any(|t| t.kind() == kind)
    }

    fn kinds(&self) -> Vec<MediaKind> {
        [MediaKind::Audio, MediaKind::Video]
            .into_iter()
            .filter(|kind| self.has_kind(*kind))
            .collect()
    }
}

/// Room hub shared by every [`LoopbackTransport`]
#[derive(Default)]
pub struct LoopbackNetwork {
    rooms: DashMap<SessionId, Vec<Member>>,
    violations: AtomicUsize,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn join(&self, identity: &SessionIdentity) -> Result<()> {
        let mut members = self.rooms.entry(identity.session.clone()).or_default();
        if members.iter().any(|m| m.participant == identity.participant) {
            return Err(MediaError::Transport(format!(
                "{} is already in the room",
                identity.participant
            )));
        }
        members.push(Member {
            participant: identity.participant.clone(),
            sender: None,
            published: Vec::new(),
        });

        info!(
            session_id = %identity.session,
            participant_id = %identity.participant,
            members = members.len(),
            "Participant joined loopback room"
        );
        Ok(())
    }

    fn depart(&self, identity: &SessionIdentity) {
        let now_empty = {
            let Some(mut members) = self.rooms.get_mut(&identity.session) else {
                return;
            };
            let before = members.len();
            members.retain(|m| m.participant != identity.participant);
            if members.len() == before {
                return;
            }
            broadcast_to_others(
                &members,
                &identity.participant,
                &TransportEvent::RemoteUnpublished {
                    participant_id: identity.participant.clone(),
                    kind: None,
                },
            );
            members.is_empty()
        };

        if now_empty {
            self.rooms.remove_if(&identity.session, |_, members| members.is_empty());
            debug!(session_id = %identity.session, "Loopback room removed");
        }
        info!(
            session_id = %identity.session,
            participant_id = %identity.participant,
            "Participant left loopback room"
        );
    }

    fn publish(&self, identity: &SessionIdentity, tracks: &[TrackHandle]) -> Result<()> {
        let mut members = self.member_room(identity)?;
        let Some(idx) = members.iter().position(|m| m.participant == identity.participant) else {
            return Err(MediaError::Transport("not a member".to_string()));
        };

        let before = members[idx].kinds();
        for track in tracks {
            if !members[idx].published.iter().any(|t| t.same_track(track)) {
                members[idx].published.push(track.clone());
            }
        }
        let after = members[idx].kinds();

        let sources: Vec<TrackSource> = members[idx].published.iter().map(TrackHandle::source).collect();
        if sources.contains(&TrackSource::Camera) && sources.contains(&TrackSource::Screen) {
            self.violations.fetch_add(1, Ordering::SeqCst);
            warn!(participant_id = %identity.participant, "Camera and screen published together");
        }

        for kind in after.into_iter().filter(|k| !before.contains(k)) {
            broadcast_to_others(
                &members,
                &identity.participant,
                &TransportEvent::RemotePublished {
                    participant_id: identity.participant.clone(),
                    kind,
                },
            );
        }
        Ok(())
    }

    fn unpublish(&self, identity: &SessionIdentity, tracks: &[TrackHandle]) -> Result<()> {
        let mut members = self.member_room(identity)?;
        let Some(idx) = members.iter().position(|m| m.participant == identity.participant) else {
            return Err(MediaError::Transport("not a member".to_string()));
        };

        let before = members[idx].kinds();
        members[idx]
            .published
            .retain(|t| !tracks.iter().any(|gone| gone.same_track(t)));
        let after = members[idx].kinds();

        for kind in before.into_iter().filter(|k| !after.contains(k)) {
            broadcast_to_others(
                &members,
                &identity.participant,
                &TransportEvent::RemoteUnpublished {
                    participant_id: identity.participant.clone(),
                    kind: Some(kind),
                },
            );
        }
        Ok(())
    }

    fn is_publishing(&self, session: &SessionId, participant: &ParticipantId, kind: MediaKind) -> bool {
        self.rooms.get(session).is_some_and(|members| {
            members
                .iter()
                .any(|m| &m.participant == participant && m.has_kind(kind))
        })
    }

    /// Fresh event feed for `identity`; current publications are replayed
    fn events(&self, identity: &SessionIdentity) -> BoxStream<'static, TransportEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();

        if let Some(mut members) = self.rooms.get_mut(&identity.session) {
            for member in members.iter().filter(|m| m.participant != identity.participant) {
                for kind in member.kinds() {
                    let _ = sender.send(TransportEvent::RemotePublished {
                        participant_id: member.participant.clone(),
                        kind,
                    });
                }
            }
            if let Some(me) = members.iter_mut().find(|m| m.participant == identity.participant) {
                me.sender = Some(sender);
            }
        }

        UnboundedReceiverStream::new(receiver).boxed()
    }

    fn member_room(
        &self,
        identity: &SessionIdentity,
    ) -> Result<dashmap::mapref::one::RefMut<'_, SessionId, Vec<Member>>> {
        self.rooms
            .get_mut(&identity.session)
            .ok_or_else(|| MediaError::Transport(format!("no room {}", identity.session)))
    }

    /// Sources currently published by a participant
    #[must_use]
    pub fn published_sources(&self, session: &SessionId, participant: &ParticipantId) -> Vec<TrackSource> {
        self.rooms
            .get(session)
            .and_then(|members| {
                members
                    .iter()
                    .find(|m| &m.participant == participant)
                    .map(|m| m.published.iter().map(TrackHandle::source).collect())
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn members(&self, session: &SessionId) -> Vec<ParticipantId> {
        self.rooms
            .get(session)
            .map(|members| members.iter().map(|m| m.participant.clone()).collect())
            .unwrap_or_default()
    }

    /// Times a participant had camera and screen video published at once
    #[must_use]
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

fn broadcast_to_others(members: &[Member], from: &ParticipantId, event: &TransportEvent) {
    for member in members.iter().filter(|m| &m.participant != from) {
        if let Some(sender) = &member.sender {
            let _ = sender.send(event.clone());
        }
    }
}

#[derive(Default)]
struct Faults {
    join: Option<MediaError>,
    leave: Option<MediaError>,
    publish: Option<MediaError>,
    subscribe: HashSet<MediaKind>,
    join_delay: Option<Duration>,
}

/// One participant's connection to a [`LoopbackNetwork`]
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    identity: Mutex<Option<SessionIdentity>>,
    faults: Mutex<Faults>,
    join_calls: AtomicUsize,
    leave_calls: AtomicUsize,
    publish_calls: AtomicUsize,
    unpublish_calls: AtomicUsize,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new(network: Arc<LoopbackNetwork>) -> Self {
        Self {
            network,
            identity: Mutex::new(None),
            faults: Mutex::new(Faults::default()),
            join_calls: AtomicUsize::new(0),
            leave_calls: AtomicUsize::new(0),
            publish_calls: AtomicUsize::new(0),
            unpublish_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_join(&self, error: MediaError) {
        self.faults.lock().join = Some(error);
    }

    pub fn fail_leave(&self, error: MediaError) {
        self.faults.lock().leave = Some(error);
    }

    /// `None` clears the fault
    pub fn fail_publish(&self, error: Option<MediaError>) {
        self.faults.lock().publish = error;
    }

    pub fn fail_subscribe(&self, kind: MediaKind) {
        self.faults.lock().subscribe.insert(kind);
    }

    pub fn clear_subscribe_faults(&self) {
        self.faults.lock().subscribe.clear();
    }

    pub fn join_delay(&self, delay: Duration) {
        self.faults.lock().join_delay = Some(delay);
    }

    #[must_use]
    pub fn join_calls(&self) -> usize {
        self.join_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn leave_calls(&self) -> usize {
        self.leave_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn unpublish_calls(&self) -> usize {
        self.unpublish_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn identity(&self) -> Option<SessionIdentity> {
        self.identity.lock().clone()
    }

    /// Sources this participant currently has published
    #[must_use]
    pub fn published_sources(&self) -> Vec<TrackSource> {
        self.identity()
            .map(|id| self.network.published_sources(&id.session, &id.participant))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }

    fn joined(&self) -> Result<SessionIdentity> {
        self.identity()
            .ok_or_else(|| MediaError::Transport("not joined".to_string()))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn join(&self, session: &SessionId, participant: &ParticipantId) -> Result<()> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);

        let (delay, fault) = {
            let faults = self.faults.lock();
            (faults.join_delay, faults.join.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = fault {
            return Err(error);
        }

        let identity = SessionIdentity::new(session.clone(), participant.clone());
        self.network.join(&identity)?;
        *self.identity.lock() = Some(identity);
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.leave_calls.fetch_add(1, Ordering::SeqCst);
        let identity = self.identity.lock().take();
        if let Some(identity) = identity {
            self.network.depart(&identity);
        }

        match self.faults.lock().leave.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn publish(&self, tracks: &[TrackHandle]) -> Result<()> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.faults.lock().publish.clone();
        if let Some(error) = fault {
            return Err(error);
        }
        let identity = self.joined()?;
        self.network.publish(&identity, tracks)
    }

    async fn unpublish(&self, tracks: &[TrackHandle]) -> Result<()> {
        self.unpublish_calls.fetch_add(1, Ordering::SeqCst);
        let identity = self.joined()?;
        self.network.unpublish(&identity, tracks)
    }

    async fn subscribe(&self, participant: &ParticipantId, kind: MediaKind) -> Result<TrackHandle> {
        let identity = self.joined()?;
        if self.faults.lock().subscribe.contains(&kind) {
            return Err(MediaError::Transport(format!(
                "subscribing to {kind} of {participant} failed"
            )));
        }
        if !self
            .network
            .is_publishing(&identity.session, participant, kind)
        {
            return Err(MediaError::NotFound(format!(
                "{participant} is not publishing {kind}"
            )));
        }
        Ok(TrackHandle::new(Arc::new(LoopbackTrack::remote(kind))))
    }

    fn events(&self) -> BoxStream<'static, TransportEvent> {
        match self.identity() {
            Some(identity) => self.network.events(&identity),
            None => stream::empty().boxed(),
        }
    }
}

// ------------------------------------------------------------------------
// Presence store
// ------------------------------------------------------------------------

/// Document store keeping JSON documents by path
pub struct MemoryPresenceStore {
    documents: RwLock<BTreeMap<String, serde_json::Value>>,
    changes: broadcast::Sender<(SessionId, PresenceChange)>,
    failing: AtomicBool,
    puts: AtomicUsize,
    deletes: AtomicUsize,
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPresenceStore {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            documents: RwLock::new(BTreeMap::new()),
            changes,
            failing: AtomicBool::new(false),
            puts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Make every call fail as if the store were unreachable
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn record(&self, key: &PresenceKey) -> Option<PresenceRecord> {
        self.documents
            .read()
            .get(&key.path())
            .and_then(|doc| serde_json::from_value(doc.clone()).ok())
    }

    #[must_use]
    pub fn records(&self, session: &SessionId) -> Vec<PresenceRecord> {
        let prefix = PresenceKey::scope_prefix(session);
        self.documents
            .read()
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(_, doc)| serde_json::from_value(doc.clone()).ok())
            .collect()
    }

    #[must_use]
    pub fn room(&self, session: &SessionId) -> Option<RoomRecord> {
        self.documents
            .read()
            .get(&RoomRecord::path(session))
            .and_then(|doc| serde_json::from_value(doc.clone()).ok())
    }

    #[must_use]
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(MediaError::Store("store unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn ensure_room(&self, session: &SessionId) -> Result<RoomRecord> {
        self.check()?;
        let path = RoomRecord::path(session);
        if let Some(room) = self.room(session) {
            return Ok(room);
        }

        let room = RoomRecord::new(session.clone());
        let doc = serde_json::to_value(&room).map_err(telecare_core::Error::from)?;
        self.documents.write().entry(path).or_insert(doc);
        debug!(session_id = %session, "Room document created");
        Ok(room)
    }

    async fn put(&self, key: &PresenceKey, record: &PresenceRecord) -> Result<()> {
        self.check()?;
        let doc = serde_json::to_value(record).map_err(telecare_core::Error::from)?;
        self.documents.write().insert(key.path(), doc);
        self.puts.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .changes
            .send((key.session.clone(), PresenceChange::Upserted(record.clone())));
        Ok(())
    }

    async fn delete(&self, key: &PresenceKey) -> Result<()> {
        self.check()?;
        let removed = self.documents.write().remove(&key.path()).is_some();
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if removed {
            let _ = self.changes.send((
                key.session.clone(),
                PresenceChange::Removed {
                    participant: key.participant.clone(),
                },
            ));
        }
        Ok(())
    }

    async fn watch(&self, session: &SessionId) -> Result<BoxStream<'static, PresenceChange>> {
        self.check()?;
        // Subscribe before the snapshot so nothing falls in between
        let live = BroadcastStream::new(self.changes.subscribe());
        let existing: Vec<PresenceChange> = self
            .records(session)
            .into_iter()
            .map(PresenceChange::Upserted)
            .collect();

        let scope = session.clone();
        let live = live.filter_map(move |change| {
            let change = match change {
                Ok((session, change)) if session == scope => Some(change),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "Presence feed lagged");
                    None
                }
            };
            futures::future::ready(change)
        });

        Ok(stream::iter(existing).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(participant: &str) -> SessionIdentity {
        SessionIdentity::new("appt-42".into(), participant.into())
    }

    #[tokio::test]
    async fn test_publish_reaches_other_members() {
        let network = LoopbackNetwork::new();
        let doc = LoopbackTransport::new(network.clone());
        let pat = LoopbackTransport::new(network.clone());

        doc.join(&"appt-42".into(), &"doc-1".into()).await.unwrap();
        pat.join(&"appt-42".into(), &"pat-2".into()).await.unwrap();
        let mut pat_events = pat.events();

        let camera = TrackHandle::new(Arc::new(LoopbackTrack::new(TrackSource::Camera)));
        doc.publish(&[camera.clone()]).await.unwrap();

        assert_eq!(
            pat_events.next().await.unwrap(),
            TransportEvent::RemotePublished {
                participant_id: "doc-1".into(),
                kind: MediaKind::Video,
            }
        );
        pat.subscribe(&"doc-1".into(), MediaKind::Video).await.unwrap();
        assert!(pat.subscribe(&"doc-1".into(), MediaKind::Audio).await.is_err());

        doc.unpublish(&[camera]).await.unwrap();
        doc.leave().await.unwrap();
        assert_eq!(
            pat_events.next().await.unwrap(),
            TransportEvent::RemoteUnpublished {
                participant_id: "doc-1".into(),
                kind: Some(MediaKind::Video),
            }
        );
        assert_eq!(
            pat_events.next().await.unwrap(),
            TransportEvent::RemoteUnpublished {
                participant_id: "doc-1".into(),
                kind: None,
            }
        );
    }

    #[tokio::test]
    async fn test_events_replay_existing_publications() {
        let network = LoopbackNetwork::new();
        let doc = LoopbackTransport::new(network.clone());
        doc.join(&"appt-42".into(), &"doc-1".into()).await.unwrap();
        let mic = TrackHandle::new(Arc::new(LoopbackTrack::new(TrackSource::Microphone)));
        doc.publish(&[mic]).await.unwrap();

        let pat = LoopbackTransport::new(network.clone());
        pat.join(&"appt-42".into(), &"pat-2".into()).await.unwrap();
        let first = pat.events().next().await.unwrap();
        assert_eq!(
            first,
            TransportEvent::RemotePublished {
                participant_id: "doc-1".into(),
                kind: MediaKind::Audio,
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_member_rejected_and_room_removed() {
        let network = LoopbackNetwork::new();
        network.join(&identity("doc-1")).unwrap();
        assert!(network.join(&identity("doc-1")).is_err());
        assert_eq!(network.room_count(), 1);

        network.depart(&identity("doc-1"));
        assert_eq!(network.room_count(), 0);
    }

    #[tokio::test]
    async fn test_camera_with_screen_is_counted() {
        let network = LoopbackNetwork::new();
        network.join(&identity("doc-1")).unwrap();
        let camera = TrackHandle::new(Arc::new(LoopbackTrack::new(TrackSource::Camera)));
        let screen = TrackHandle::new(Arc::new(LoopbackTrack::new(TrackSource::Screen)));

        network.publish(&identity("doc-1"), &[camera]).unwrap();
        assert_eq!(network.violations(), 0);
        network.publish(&identity("doc-1"), &[screen]).unwrap();
        assert_eq!(network.violations(), 1);
    }

    #[tokio::test]
    async fn test_devices_configuration() {
        let devices = LoopbackDevices::new().cameras(2).without_microphone();
        assert_eq!(devices.list_cameras().await.unwrap().len(), 2);
        assert!(matches!(
            devices.acquire_microphone().await,
            Err(MediaError::NotFound(_))
        ));

        let camera = devices
            .acquire_camera(Some(DeviceDescriptor::new("cam-1", "")))
            .await
            .unwrap();
        assert_eq!(camera.device_id().as_deref(), Some("cam-1"));
        assert!(devices
            .acquire_camera(Some(DeviceDescriptor::new("cam-9", "")))
            .await
            .is_err());
        assert_eq!(devices.camera_acquisitions(), 2);
    }

    #[tokio::test]
    async fn test_screen_end_fires_ended() {
        let devices = LoopbackDevices::new();
        assert!(!devices.end_screen_share());

        let capture = devices.acquire_screen().await.unwrap();
        let ended = capture.video().ended().unwrap();
        assert!(devices.end_screen_share());
        ended.await;
    }

    #[tokio::test]
    async fn test_memory_store_watch_replays_and_scopes() {
        let store = MemoryPresenceStore::new();
        let ana = PresenceRecord::new("appt-42".into(), "pat-2".into(), "Ana".into());
        store.put(&ana.key(), &ana).await.unwrap();

        let mut feed = store.watch(&"appt-42".into()).await.unwrap();
        assert_eq!(feed.next().await.unwrap(), PresenceChange::Upserted(ana));

        let other = PresenceRecord::new("appt-7".into(), "x".into(), "X".into());
        store.put(&other.key(), &other).await.unwrap();
        let key = PresenceKey::new("appt-42".into(), "pat-2".into());
        store.delete(&key).await.unwrap();

        assert_eq!(
            feed.next().await.unwrap(),
            PresenceChange::Removed {
                participant: "pat-2".into()
            }
        );
        assert!(store.records(&"appt-42".into()).is_empty());
        assert_eq!(store.records(&"appt-7".into()).len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_failure() {
        let store = MemoryPresenceStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.ensure_room(&"appt-42".into()).await,
            Err(MediaError::Store(_))
        ));
        store.set_failing(false);
        let room = store.ensure_room(&"appt-42".into()).await.unwrap();
        assert!(room.is_active);
        assert_eq!(store.ensure_room(&"appt-42".into()).await.unwrap(), room);
    }
}
