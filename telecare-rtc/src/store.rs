//! Presence store capability

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use telecare_core::models::{ParticipantId, PresenceKey, PresenceRecord, RoomRecord, SessionId};

/// Change in the participant scope of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum PresenceChange {
    Upserted(PresenceRecord),
    Removed { participant: ParticipantId },
}

/// Key-value document store holding presence records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Fetch the room document, creating it when absent
    async fn ensure_room(&self, session: &SessionId) -> Result<RoomRecord>;

    async fn put(&self, key: &PresenceKey, record: &PresenceRecord) -> Result<()>;

    /// Removing an absent key is not an error
    async fn delete(&self, key: &PresenceKey) -> Result<()>;

    /// Change feed for all presence records of a session. Existing records
    /// are delivered first as `Upserted`.
    async fn watch(&self, session: &SessionId) -> Result<BoxStream<'static, PresenceChange>>;
}
