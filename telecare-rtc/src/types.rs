//! Common types used throughout the session coordinator

use serde::{Deserialize, Serialize};
use std::fmt;

use telecare_core::models::{ParticipantId, SessionId};

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a local track captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    /// System audio captured alongside a screen share
    ScreenAudio,
    /// Track received from another participant
    Remote,
}

impl TrackSource {
    #[must_use]
    pub const fn kind(&self) -> Option<MediaKind> {
        match self {
            Self::Microphone | Self::ScreenAudio => Some(MediaKind::Audio),
            Self::Camera | Self::Screen => Some(MediaKind::Video),
            Self::Remote => None,
        }
    }
}

/// A capture device as reported by the device capability
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub label: String,
}

impl DeviceDescriptor {
    pub fn new(device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            label: label.into(),
        }
    }
}

/// Per-kind subscription state of a remote participant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    Subscribed,
}

/// UI surface a track renders into, keyed by the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderTarget(String);

impl RenderTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Conventional surface for the local camera preview
    #[must_use]
    pub fn local_video() -> Self {
        Self("local-video".to_string())
    }

    /// Conventional surface for a remote participant's tile
    #[must_use]
    pub fn remote_video(participant: &ParticipantId) -> Self {
        Self(format!("remote-video-{participant}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RenderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity a coordinator is bound to once `join` has been requested
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session: SessionId,
    pub participant: ParticipantId,
}

impl SessionIdentity {
    #[must_use]
    pub const fn new(session: SessionId, participant: ParticipantId) -> Self {
        Self {
            session,
            participant,
        }
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session, self.participant)
    }
}
