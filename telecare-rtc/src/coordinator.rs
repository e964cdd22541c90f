//! Session coordinator
//!
//! Top-level state machine (`Idle -> Joining -> Joined -> Leaving -> Left`)
//! owning one local media controller, one remote registry and one presence
//! synchronizer per session.
//!
//! Every user operation takes the `ops` lock, so join, leave and the toggles
//! never interleave. The phase lives outside that lock: `leave` flips it to
//! `Leaving` immediately, and an in-flight `join` notices at its next
//! suspension point and hands over to the teardown.

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::DeviceCatalog;
use crate::config::CoordinatorConfig;
use crate::device::DeviceProvider;
use crate::error::{bounded, DeviceError, JoinError, RegistryError, ScreenShareError, SessionError};
use crate::local::LocalMediaController;
use crate::presence::PresenceSynchronizer;
use crate::registry::RemoteTrackRegistry;
use crate::state::{LocalMediaState, SessionEvent, SessionPhase, SessionState};
use crate::store::PresenceStore;
use crate::transport::Transport;
use crate::types::{DeviceDescriptor, MediaKind, RenderTarget, SessionIdentity};
use telecare_core::models::{ParticipantId, SessionId, TrackId};

const MIN_PROJECTION_INTERVAL: Duration = Duration::from_millis(1);

/// External capabilities a coordinator drives
#[derive(Clone)]
pub struct Capabilities {
    pub transport: Arc<dyn Transport>,
    pub devices: Arc<dyn DeviceProvider>,
    pub presence: Arc<dyn PresenceStore>,
}

#[derive(Default)]
struct PhaseState {
    phase: SessionPhase,
    identity: Option<SessionIdentity>,
}

/// Resources owned while a session is live
struct ActiveSession {
    local: LocalMediaController,
    presence: PresenceSynchronizer,
    screen_watch: Option<JoinHandle<()>>,
}

struct Inner {
    config: CoordinatorConfig,
    capabilities: Capabilities,
    catalog: DeviceCatalog,
    phase: RwLock<PhaseState>,
    local_view: Arc<RwLock<LocalMediaState>>,
    registry: RemoteTrackRegistry,
    events: broadcast::Sender<SessionEvent>,
    /// Fired by `leave`; lets a join in progress stop before publishing
    cancel: CancellationToken,
    ops: Mutex<Option<ActiveSession>>,
}

/// Handle to one media session. Clones share the same session.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    /// Must be called inside a tokio runtime
    pub fn new(config: CoordinatorConfig, capabilities: Capabilities) -> Self {
        let (events, _) = broadcast::channel(config.state_broadcast_capacity.max(1));
        let registry = RemoteTrackRegistry::new(
            Arc::clone(&capabilities.transport),
            config.transport_op_timeout,
            config.event_channel_capacity,
            events.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                catalog: DeviceCatalog::new(Arc::clone(&capabilities.devices)),
                config,
                capabilities,
                phase: RwLock::new(PhaseState::default()),
                local_view: Arc::new(RwLock::new(LocalMediaState::default())),
                registry,
                events,
                cancel: CancellationToken::new(),
                ops: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.inner.phase.read().phase
    }

    #[must_use]
    pub fn identity(&self) -> Option<SessionIdentity> {
        self.inner.phase.read().identity.clone()
    }

    /// Join `session` as `participant`. A repeated call for the same
    /// identity while joining or joined succeeds without doing anything.
    pub async fn join(
        &self,
        session: SessionId,
        participant: ParticipantId,
        display_name: &str,
    ) -> Result<(), JoinError> {
        let identity = SessionIdentity::new(session, participant);

        {
            let mut state = self.inner.phase.write();
            match (state.phase, state.identity.clone()) {
                (SessionPhase::Idle, _) => {
                    state.phase = SessionPhase::Joining;
                    state.identity = Some(identity.clone());
                }
                (SessionPhase::Joining | SessionPhase::Joined, Some(active)) if active == identity => {
                    debug!(identity = %identity, phase = %state.phase, "Duplicate join ignored");
                    return Ok(());
                }
                (SessionPhase::Joining | SessionPhase::Joined, Some(active)) => {
                    return Err(JoinError::AlreadyActive { active });
                }
                _ => return Err(JoinError::SessionEnded),
            }
        }
        self.announce_phase(SessionPhase::Joining);
        info!(
            session_id = %identity.session,
            participant_id = %identity.participant,
            "Joining session"
        );

        let mut ops = self.inner.ops.lock().await;
        if self.phase() != SessionPhase::Joining {
            return Err(JoinError::Cancelled);
        }

        let transport = &self.inner.capabilities.transport;
        if let Err(e) = bounded(
            self.inner.config.transport_join_timeout,
            "transport join",
            transport.join(&identity.session, &identity.participant),
        )
        .await
        {
            error!(
                session_id = %identity.session,
                participant_id = %identity.participant,
                error = %e,
                "Transport join failed"
            );
            // A timed-out join may still complete underneath
            if let Err(leave_err) = bounded(
                self.inner.config.transport_op_timeout,
                "transport leave",
                transport.leave(),
            )
            .await
            {
                debug!(error = %leave_err, "Leave after failed join also failed");
            }
            self.transition(&[SessionPhase::Joining, SessionPhase::Leaving], SessionPhase::Left);
            return Err(JoinError::TransportJoinFailed(e));
        }

        let session = ops.insert(self.new_active_session(identity.clone()));

        if !self.transition(&[SessionPhase::Joining], SessionPhase::Joined) {
            info!(identity = %identity, "Join cancelled after transport join");
            return Err(JoinError::Cancelled);
        }

        let local = session.local.start(&self.inner.cancel).await;
        if self.phase() != SessionPhase::Joined {
            info!(identity = %identity, "Join cancelled during local media start");
            return Err(JoinError::Cancelled);
        }

        session.presence.announce(display_name);
        self.inner
            .registry
            .attach(identity.participant.clone(), transport.events());
        session.presence.start_watch();

        info!(
            session_id = %identity.session,
            participant_id = %identity.participant,
            mic = local.mic.is_some(),
            camera = local.camera.is_some(),
            "Joined session"
        );
        Ok(())
    }

    /// Tear the session down. Safe to call repeatedly and after a failed
    /// join; every step runs even if an earlier one failed.
    pub async fn leave(&self) {
        let already_leaving = {
            let mut state = self.inner.phase.write();
            match state.phase {
                SessionPhase::Joining | SessionPhase::Joined => {
                    state.phase = SessionPhase::Leaving;
                    self.inner.cancel.cancel();
                    false
                }
                SessionPhase::Leaving => true,
                SessionPhase::Idle | SessionPhase::Left => return,
            }
        };

        if already_leaving {
            // The first caller holds or is queued on the ops lock
            let _ops = self.inner.ops.lock().await;
            return;
        }
        self.announce_phase(SessionPhase::Leaving);

        let mut ops = self.inner.ops.lock().await;
        if let Some(mut session) = ops.take() {
            if let Some(watch) = session.screen_watch.take() {
                watch.abort();
            }

            session.local.shutdown().await;

            if let Err(e) = bounded(
                self.inner.config.transport_op_timeout,
                "transport leave",
                self.inner.capabilities.transport.leave(),
            )
            .await
            {
                error!(error = %e, "Transport leave failed, local resources released anyway");
            }

            session.presence.retire().await;
        }

        self.inner.registry.detach();
        if let Err(e) = self.inner.registry.clear().await {
            warn!(error = %e, "Clearing remote registry failed");
        }

        self.transition(&[SessionPhase::Leaving], SessionPhase::Left);
        drop(ops);
        info!(identity = ?self.identity(), "Left session");
    }

    pub async fn toggle_mic(&self, enabled: bool) -> Result<(), SessionError> {
        let mut ops = self.inner.ops.lock().await;
        let session = self.joined(&mut ops).map_err(SessionError::NotJoined)?;
        session.local.set_mic_enabled(enabled).await?;
        Ok(())
    }

    pub async fn toggle_camera(&self, enabled: bool) -> Result<(), SessionError> {
        let mut ops = self.inner.ops.lock().await;
        let session = self.joined(&mut ops).map_err(SessionError::NotJoined)?;
        session.local.set_camera_enabled(enabled).await?;
        Ok(())
    }

    /// Start or stop sharing. Returns whether a share is active afterwards.
    pub async fn toggle_screen_share(&self) -> Result<bool, ScreenShareError> {
        let mut ops = self.inner.ops.lock().await;
        let session = self.joined(&mut ops).map_err(ScreenShareError::NotJoined)?;

        if session.local.screen_active() {
            if let Some(watch) = session.screen_watch.take() {
                watch.abort();
            }
            session.local.stop_screen_share().await;
            return Ok(false);
        }

        let started = session.local.start_screen_share().await?;
        if let Some(ended) = started.ended {
            session.screen_watch = Some(self.watch_screen_end(started.track_id, ended));
        }
        Ok(true)
    }

    /// Move to the next camera in enumeration order, keeping the published track
    pub async fn switch_camera(&self) -> Result<DeviceDescriptor, DeviceError> {
        let mut ops = self.inner.ops.lock().await;
        let session = self.joined(&mut ops).map_err(DeviceError::NotJoined)?;

        let current = session.local.active_camera_device_id();
        let next = self.inner.catalog.next_camera(current.as_deref()).await?;
        session.local.switch_camera(next.clone()).await?;
        Ok(next)
    }

    pub async fn list_cameras(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        self.inner
            .catalog
            .list_cameras()
            .await
            .map_err(DeviceError::Switch)
    }

    pub async fn has_multiple_cameras(&self) -> bool {
        self.inner.catalog.has_multiple_cameras().await
    }

    pub async fn play_local_video(&self, target: &RenderTarget) -> Result<(), SessionError> {
        let mut ops = self.inner.ops.lock().await;
        let session = self.joined(&mut ops).map_err(SessionError::NotJoined)?;
        session.local.play_camera(target)?;
        Ok(())
    }

    pub async fn play_screen_share(&self, target: &RenderTarget) -> Result<(), SessionError> {
        let mut ops = self.inner.ops.lock().await;
        let session = self.joined(&mut ops).map_err(SessionError::NotJoined)?;
        session.local.play_screen(target)?;
        Ok(())
    }

    pub fn play_remote(
        &self,
        participant: &ParticipantId,
        kind: MediaKind,
        target: &RenderTarget,
    ) -> Result<(), RegistryError> {
        self.inner.registry.play(participant, kind, target)
    }

    /// Caller-driven retry after a `RemoteSubscribeFailed` event
    pub async fn resubscribe(
        &self,
        participant: ParticipantId,
        kind: MediaKind,
    ) -> Result<(), RegistryError> {
        self.inner.registry.resubscribe(participant, kind).await
    }

    #[must_use]
    pub fn registry(&self) -> &RemoteTrackRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        let (phase, identity) = {
            let state = self.inner.phase.read();
            (state.phase, state.identity.clone())
        };
        let (session, participant) = identity
            .map(|id| (Some(id.session), Some(id.participant)))
            .unwrap_or_default();

        SessionState {
            phase,
            session,
            participant,
            local: self.inner.local_view.read().clone(),
            remotes: self.inner.registry.snapshot(),
        }
    }

    /// Remote participants plus self while joined
    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.snapshot().participant_count()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot stream refreshed every `every` (at least 1ms), first item
    /// immediately
    #[must_use]
    pub fn projection(&self, every: Duration) -> BoxStream<'static, SessionState> {
        let coordinator = self.clone();
        let every = every.max(MIN_PROJECTION_INTERVAL);
        IntervalStream::new(tokio::time::interval(every))
            .map(move |_| coordinator.snapshot())
            .boxed()
    }

    fn new_active_session(&self, identity: SessionIdentity) -> ActiveSession {
        let config = &self.inner.config;
        let capabilities = &self.inner.capabilities;

        ActiveSession {
            local: LocalMediaController::new(
                Arc::clone(&capabilities.devices),
                Arc::clone(&capabilities.transport),
                config.device_timeout,
                config.transport_op_timeout,
                Arc::clone(&self.inner.local_view),
                self.inner.events.clone(),
            ),
            presence: PresenceSynchronizer::new(
                Arc::clone(&capabilities.presence),
                config.presence.clone(),
                identity,
                self.inner.registry.clone(),
            ),
            screen_watch: None,
        }
    }

    fn joined<'a>(
        &self,
        ops: &'a mut Option<ActiveSession>,
    ) -> Result<&'a mut ActiveSession, SessionPhase> {
        let phase = self.phase();
        match ops.as_mut() {
            Some(session) if phase == SessionPhase::Joined => Ok(session),
            _ => Err(phase),
        }
    }

    /// Move to `to` if the current phase is one of `from`
    fn transition(&self, from: &[SessionPhase], to: SessionPhase) -> bool {
        let changed = {
            let mut state = self.inner.phase.write();
            if from.contains(&state.phase) {
                state.phase = to;
                true
            } else {
                false
            }
        };
        if changed {
            self.announce_phase(to);
        }
        changed
    }

    fn announce_phase(&self, phase: SessionPhase) {
        debug!(phase = %phase, "Session phase changed");
        let _ = self.inner.events.send(SessionEvent::PhaseChanged { phase });
    }

    fn watch_screen_end(&self, track_id: TrackId, ended: BoxFuture<'static, ()>) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            ended.await;
            if let Some(inner) = inner.upgrade() {
                Self { inner }.on_screen_ended(track_id).await;
            }
        })
    }

    async fn on_screen_ended(&self, track_id: TrackId) {
        let mut ops = self.inner.ops.lock().await;
        let Ok(session) = self.joined(&mut ops) else {
            return;
        };
        if session.local.screen_track_id().as_ref() != Some(&track_id) {
            return;
        }

        // This task is the watcher; drop its handle without aborting it
        session.screen_watch = None;
        session.local.stop_screen_share().await;
        info!(track_id = %track_id, "Screen share ended externally");
        let _ = self.inner.events.send(SessionEvent::ScreenShareEnded);
    }
}
