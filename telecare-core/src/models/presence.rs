//! Durable roster documents for a video session
//!
//! These records live in an external key-value store. They carry display
//! metadata only; membership of the call itself is owned by the transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{ParticipantId, SessionId};

/// Collection under which room documents are stored
pub const ROOMS_COLLECTION: &str = "videoRooms";

/// Sub-collection holding one document per participant
pub const PARTICIPANTS_COLLECTION: &str = "participants";

/// Store key of a participant's presence document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceKey {
    pub session: SessionId,
    pub participant: ParticipantId,
}

impl PresenceKey {
    #[must_use]
    pub const fn new(session: SessionId, participant: ParticipantId) -> Self {
        Self {
            session,
            participant,
        }
    }

    /// Document path, e.g. `videoRooms/appt-42/participants/doc-1`
    #[must_use]
    pub fn path(&self) -> String {
        format!(
            "{ROOMS_COLLECTION}/{}/{PARTICIPANTS_COLLECTION}/{}",
            self.session, self.participant
        )
    }

    /// Path prefix shared by every participant document of a session
    #[must_use]
    pub fn scope_prefix(session: &SessionId) -> String {
        format!("{ROOMS_COLLECTION}/{session}/{PARTICIPANTS_COLLECTION}/")
    }
}

impl std::fmt::Display for PresenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

/// Presence record written on join and deleted on leave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub session: SessionId,
    pub participant: ParticipantId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

impl PresenceRecord {
    #[must_use]
    pub fn new(session: SessionId, participant: ParticipantId, display_name: String) -> Self {
        Self {
            session,
            participant,
            display_name,
            joined_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> PresenceKey {
        PresenceKey::new(self.session.clone(), self.participant.clone())
    }
}

/// Room document, get-or-created before the first participant announces itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub session: SessionId,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoomRecord {
    #[must_use]
    pub fn new(session: SessionId) -> Self {
        let now = Utc::now();
        Self {
            session,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Document path, e.g. `videoRooms/appt-42`
    #[must_use]
    pub fn path(session: &SessionId) -> String {
        format!("{ROOMS_COLLECTION}/{session}")
    }
}
