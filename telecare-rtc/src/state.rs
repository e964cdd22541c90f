//! Observable session state and events

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::track::{TrackHandle, TrackState};
use crate::types::{MediaKind, SubscriptionState};
use telecare_core::models::{ParticipantId, SessionId, TrackId};

/// Lifecycle of a coordinator. `Left` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Joining,
    Joined,
    Leaving,
    Left,
}

impl SessionPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Leaving => "leaving",
            Self::Left => "left",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable view of a local track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSummary {
    pub id: TrackId,
    pub state: TrackState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl From<&TrackHandle> for TrackSummary {
    fn from(track: &TrackHandle) -> Self {
        Self {
            id: track.id().clone(),
            state: track.state(),
            device_id: track.device_id(),
        }
    }
}

/// Local media as seen by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMediaState {
    pub mic: Option<TrackSummary>,
    pub camera: Option<TrackSummary>,
    pub screen: Option<TrackSummary>,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub screen_active: bool,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            mic: None,
            camera: None,
            screen: None,
            mic_enabled: true,
            camera_enabled: true,
            screen_active: false,
        }
    }
}

/// One remote participant in the roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteParticipant {
    pub id: ParticipantId,
    pub audio: SubscriptionState,
    pub video: SubscriptionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl RemoteParticipant {
    #[must_use]
    pub fn new(id: ParticipantId) -> Self {
        Self {
            id,
            audio: SubscriptionState::Unsubscribed,
            video: SubscriptionState::Unsubscribed,
            display_name: None,
        }
    }

    #[must_use]
    pub const fn subscription(&self, kind: MediaKind) -> SubscriptionState {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }

    pub fn set_subscription(&mut self, kind: MediaKind, state: SubscriptionState) {
        match kind {
            MediaKind::Audio => self.audio = state,
            MediaKind::Video => self.video = state,
        }
    }
}

/// Snapshot of everything the UI renders
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: SessionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant: Option<ParticipantId>,
    pub local: LocalMediaState,
    pub remotes: BTreeMap<ParticipantId, RemoteParticipant>,
}

impl SessionState {
    /// Remote participants plus the local one while in a session
    #[must_use]
    pub fn participant_count(&self) -> usize {
        if self.phase == SessionPhase::Joined {
            self.remotes.len() + 1
        } else {
            self.remotes.len()
        }
    }
}

/// Change notifications broadcast to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    PhaseChanged {
        phase: SessionPhase,
    },
    LocalMediaChanged {
        local: LocalMediaState,
    },
    RemoteSubscribed {
        participant_id: ParticipantId,
        kind: MediaKind,
    },
    RemoteSubscribeFailed {
        participant_id: ParticipantId,
        kind: MediaKind,
        reason: String,
    },
    RemoteUnpublished {
        participant_id: ParticipantId,
        kind: MediaKind,
    },
    RemoteDeparted {
        participant_id: ParticipantId,
    },
    DisplayNameUpdated {
        participant_id: ParticipantId,
        display_name: String,
    },
    /// The screen capture was ended outside the application
    ScreenShareEnded,
}
