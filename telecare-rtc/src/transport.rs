//! Realtime transport capability

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::track::TrackHandle;
use crate::types::MediaKind;
use telecare_core::models::{ParticipantId, SessionId};

/// Remote publication changes delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    RemotePublished {
        participant_id: ParticipantId,
        kind: MediaKind,
    },
    /// `kind: None` means the participant left the session entirely
    RemoteUnpublished {
        participant_id: ParticipantId,
        kind: Option<MediaKind>,
    },
}

impl TransportEvent {
    #[must_use]
    pub const fn participant_id(&self) -> &ParticipantId {
        match self {
            Self::RemotePublished { participant_id, .. }
            | Self::RemoteUnpublished { participant_id, .. } => participant_id,
        }
    }
}

/// Joins a session, publishes local tracks and subscribes to remote ones
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn join(&self, session: &SessionId, participant: &ParticipantId) -> Result<()>;

    async fn leave(&self) -> Result<()>;

    async fn publish(&self, tracks: &[TrackHandle]) -> Result<()>;

    async fn unpublish(&self, tracks: &[TrackHandle]) -> Result<()>;

    async fn subscribe(&self, participant: &ParticipantId, kind: MediaKind) -> Result<TrackHandle>;

    /// Stream of remote events for the current session. Publications that
    /// exist at the time of the call are replayed first.
    fn events(&self) -> BoxStream<'static, TransportEvent>;
}
