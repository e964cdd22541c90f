//! Remote participant registry
//!
//! Transport events and presence changes are queued on one bounded channel
//! and applied, in arrival order, by a single worker task. The worker is the
//! only writer of the participant map; readers take whole-map snapshots.

use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{bounded, MediaError, RegistryError};
use crate::state::{RemoteParticipant, SessionEvent};
use crate::store::PresenceChange;
use crate::track::TrackHandle;
use crate::transport::{Transport, TransportEvent};
use crate::types::{MediaKind, RenderTarget, SubscriptionState};
use telecare_core::models::ParticipantId;

type RegistryResult<T> = std::result::Result<T, RegistryError>;

enum RegistryCommand {
    Transport(TransportEvent),
    Presence(PresenceChange),
    Resubscribe {
        participant: ParticipantId,
        kind: MediaKind,
        result_sender: oneshot::Sender<RegistryResult<()>>,
    },
    Clear {
        result_sender: oneshot::Sender<()>,
    },
    Settle {
        result_sender: oneshot::Sender<()>,
    },
}

struct Shared {
    participants: RwLock<BTreeMap<ParticipantId, RemoteParticipant>>,
    tracks: RwLock<HashMap<(ParticipantId, MediaKind), TrackHandle>>,
    local: RwLock<Option<ParticipantId>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the registry worker. Clones share the same registry.
#[derive(Clone)]
pub struct RemoteTrackRegistry {
    shared: Arc<Shared>,
    sender: mpsc::Sender<RegistryCommand>,
}

impl RemoteTrackRegistry {
    /// Spawns the worker task; must be called inside a tokio runtime
    pub fn new(
        transport: Arc<dyn Transport>,
        op_timeout: Duration,
        capacity: usize,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let shared = Arc::new(Shared {
            participants: RwLock::new(BTreeMap::new()),
            tracks: RwLock::new(HashMap::new()),
            local: RwLock::new(None),
            pump: Mutex::new(None),
        });
        let (sender, receiver) = mpsc::channel(capacity.max(1));

        let worker = Worker {
            shared: Arc::clone(&shared),
            transport,
            op_timeout,
            events,
            names: HashMap::new(),
        };
        tokio::spawn(worker.run(receiver));

        Self { shared, sender }
    }

    /// Start feeding transport events into the registry. Events about
    /// `local` itself are ignored.
    pub fn attach(&self, local: ParticipantId, mut events: BoxStream<'static, TransportEvent>) {
        *self.shared.local.write() = Some(local);

        let sender = self.sender.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if sender.send(RegistryCommand::Transport(event)).await.is_err() {
                    break;
                }
            }
            debug!("Transport event stream ended");
        });

        if let Some(previous) = self.shared.pump.lock().replace(pump) {
            previous.abort();
        }
    }

    /// Stop consuming transport events
    pub fn detach(&self) {
        if let Some(pump) = self.shared.pump.lock().take() {
            pump.abort();
        }
    }

    pub async fn dispatch(&self, event: TransportEvent) -> RegistryResult<()> {
        self.send(RegistryCommand::Transport(event)).await
    }

    pub async fn apply_presence(&self, change: PresenceChange) -> RegistryResult<()> {
        self.send(RegistryCommand::Presence(change)).await
    }

    /// Retry a failed subscription. Failures are returned, never retried here.
    pub async fn resubscribe(&self, participant: ParticipantId, kind: MediaKind) -> RegistryResult<()> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.send(RegistryCommand::Resubscribe {
            participant,
            kind,
            result_sender,
        })
        .await?;
        result_receiver.await.map_err(|_| RegistryError::Closed)?
    }

    /// Drop every remote entry and release the subscribed tracks
    pub async fn clear(&self) -> RegistryResult<()> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.send(RegistryCommand::Clear { result_sender }).await?;
        result_receiver.await.map_err(|_| RegistryError::Closed)
    }

    /// Wait until everything queued so far has been applied
    pub async fn settled(&self) -> RegistryResult<()> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.send(RegistryCommand::Settle { result_sender }).await?;
        result_receiver.await.map_err(|_| RegistryError::Closed)
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<ParticipantId, RemoteParticipant> {
        self.shared.participants.read().clone()
    }

    #[must_use]
    pub fn get(&self, participant: &ParticipantId) -> Option<RemoteParticipant> {
        self.shared.participants.read().get(participant).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.participants.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn remote_track(&self, participant: &ParticipantId, kind: MediaKind) -> Option<TrackHandle> {
        self.shared
            .tracks
            .read()
            .get(&(participant.clone(), kind))
            .cloned()
    }

    pub fn play(
        &self,
        participant: &ParticipantId,
        kind: MediaKind,
        target: &RenderTarget,
    ) -> RegistryResult<()> {
        if !self.shared.participants.read().contains_key(participant) {
            return Err(RegistryError::UnknownParticipant(participant.clone()));
        }
        let track = self
            .remote_track(participant, kind)
            .ok_or_else(|| RegistryError::NotSubscribed {
                participant: participant.clone(),
                kind,
            })?;
        track.play(target).map_err(RegistryError::Playback)
    }

    async fn send(&self, command: RegistryCommand) -> RegistryResult<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| RegistryError::Closed)
    }
}

struct Worker {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    op_timeout: Duration,
    events: broadcast::Sender<SessionEvent>,
    /// Latest display names from the presence feed, including participants
    /// that have not published media yet
    names: HashMap<ParticipantId, String>,
}

impl Worker {
    async fn run(mut self, mut receiver: mpsc::Receiver<RegistryCommand>) {
        while let Some(command) = receiver.recv().await {
            match command {
                RegistryCommand::Transport(event) => self.on_transport(event).await,
                RegistryCommand::Presence(change) => self.on_presence(change),
                RegistryCommand::Resubscribe {
                    participant,
                    kind,
                    result_sender,
                } => {
                    let result = self.resubscribe(participant, kind).await;
                    let _ = result_sender.send(result);
                }
                RegistryCommand::Clear { result_sender } => {
                    self.clear();
                    let _ = result_sender.send(());
                }
                RegistryCommand::Settle { result_sender } => {
                    let _ = result_sender.send(());
                }
            }
        }
        self.clear();
        debug!("Registry worker stopped");
    }

    fn is_local(&self, participant: &ParticipantId) -> bool {
        self.shared.local.read().as_ref() == Some(participant)
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        if self.is_local(event.participant_id()) {
            return;
        }

        match event {
            TransportEvent::RemotePublished {
                participant_id,
                kind,
            } => self.on_published(participant_id, kind).await,
            TransportEvent::RemoteUnpublished {
                participant_id,
                kind: Some(kind),
            } => self.on_unpublished(&participant_id, kind),
            TransportEvent::RemoteUnpublished {
                participant_id,
                kind: None,
            } => self.on_departed(&participant_id),
        }
    }

    async fn on_published(&mut self, participant: ParticipantId, kind: MediaKind) {
        let created = {
            let mut participants = self.shared.participants.write();
            let mut created = false;
            participants.entry(participant.clone()).or_insert_with(|| {
                created = true;
                let mut entry = RemoteParticipant::new(participant.clone());
                entry.display_name = self.names.get(&participant).cloned();
                entry
            });
            created
        };
        if created {
            info!(participant_id = %participant, "Remote participant appeared");
        }

        if let Err(e) = self.subscribe(&participant, kind).await {
            warn!(
                participant_id = %participant,
                kind = %kind,
                error = %e,
                "Subscribing to remote track failed"
            );
            let _ = self.events.send(SessionEvent::RemoteSubscribeFailed {
                participant_id: participant,
                kind,
                reason: e.to_string(),
            });
        }
    }

    async fn subscribe(&mut self, participant: &ParticipantId, kind: MediaKind) -> Result<(), MediaError> {
        let track = bounded(
            self.op_timeout,
            "remote subscribe",
            self.transport.subscribe(participant, kind),
        )
        .await?;

        {
            let mut participants = self.shared.participants.write();
            let Some(entry) = participants.get_mut(participant) else {
                // Departed while the subscribe was in flight
                track.release();
                return Ok(());
            };
            entry.set_subscription(kind, SubscriptionState::Subscribed);
            if let Some(previous) = self
                .shared
                .tracks
                .write()
                .insert((participant.clone(), kind), track)
            {
                previous.release();
            }
        }

        debug!(participant_id = %participant, kind = %kind, "Remote track subscribed");
        let _ = self.events.send(SessionEvent::RemoteSubscribed {
            participant_id: participant.clone(),
            kind,
        });
        Ok(())
    }

    async fn resubscribe(&mut self, participant: ParticipantId, kind: MediaKind) -> RegistryResult<()> {
        if !self.shared.participants.read().contains_key(&participant) {
            return Err(RegistryError::UnknownParticipant(participant));
        }
        self.subscribe(&participant, kind)
            .await
            .map_err(|source| RegistryError::Subscribe {
                participant,
                kind,
                source,
            })
    }

    fn on_unpublished(&self, participant: &ParticipantId, kind: MediaKind) {
        {
            let mut participants = self.shared.participants.write();
            let Some(entry) = participants.get_mut(participant) else {
                return;
            };
            entry.set_subscription(kind, SubscriptionState::Unsubscribed);
            if let Some(track) = self.shared.tracks.write().remove(&(participant.clone(), kind)) {
                track.release();
            }
        }

        debug!(participant_id = %participant, kind = %kind, "Remote track unpublished");
        let _ = self.events.send(SessionEvent::RemoteUnpublished {
            participant_id: participant.clone(),
            kind,
        });
    }

    fn on_departed(&self, participant: &ParticipantId) {
        {
            let mut participants = self.shared.participants.write();
            if participants.remove(participant).is_none() {
                return;
            }
            let mut tracks = self.shared.tracks.write();
            for kind in [MediaKind::Audio, MediaKind::Video] {
                if let Some(track) = tracks.remove(&(participant.clone(), kind)) {
                    track.release();
                }
            }
        }

        info!(participant_id = %participant, "Remote participant departed");
        let _ = self.events.send(SessionEvent::RemoteDeparted {
            participant_id: participant.clone(),
        });
    }

    /// Presence only ever names existing entries, it never creates them
    fn on_presence(&mut self, change: PresenceChange) {
        match change {
            PresenceChange::Upserted(record) => {
                let participant = record.participant;
                let name = record.display_name;
                self.names.insert(participant.clone(), name.clone());

                let updated = {
                    let mut participants = self.shared.participants.write();
                    match participants.get_mut(&participant) {
                        Some(entry) if entry.display_name.as_deref() != Some(name.as_str()) => {
                            entry.display_name = Some(name.clone());
                            true
                        }
                        _ => false,
                    }
                };

                if updated {
                    debug!(participant_id = %participant, display_name = %name, "Remote display name updated");
                    let _ = self.events.send(SessionEvent::DisplayNameUpdated {
                        participant_id: participant,
                        display_name: name,
                    });
                }
            }
            PresenceChange::Removed { participant } => {
                self.names.remove(&participant);
            }
        }
    }

    fn clear(&mut self) {
        let released = {
            let mut participants = self.shared.participants.write();
            let mut tracks = self.shared.tracks.write();
            participants.clear();
            let released = tracks.len();
            for (_, track) in tracks.drain() {
                track.release();
            }
            released
        };
        self.names.clear();
        if released > 0 {
            debug!(released, "Remote tracks released");
        }
    }
}
