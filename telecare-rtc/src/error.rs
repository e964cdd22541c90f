//! Error types for the session coordinator

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::state::SessionPhase;
use crate::types::{MediaKind, SessionIdentity};
use telecare_core::models::ParticipantId;

/// Failure reported by one of the consumed capabilities
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The user dismissed a picker (screen share)
    #[error("Cancelled by user")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Track has been stopped and cannot be reused")]
    TrackStopped,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Presence store error: {0}")]
    Store(String),

    #[error("Channel closed: {0}")]
    Closed(String),
}

impl From<telecare_core::Error> for MediaError {
    fn from(err: telecare_core::Error) -> Self {
        Self::Store(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("Coordinator is already bound to {active}")]
    AlreadyActive { active: SessionIdentity },

    #[error("Transport join failed: {0}")]
    TransportJoinFailed(#[source] MediaError),

    #[error("Join cancelled by leave")]
    Cancelled,

    #[error("Session has ended; create a new coordinator to rejoin")]
    SessionEnded,
}

#[derive(Debug, Error)]
pub enum ScreenShareError {
    /// Picker dismissed; the UI may ignore this silently
    #[error("Screen share denied by user")]
    Denied,

    #[error("Screen share requires a joined session (phase: {0})")]
    NotJoined(SessionPhase),

    #[error("Screen capture failed: {0}")]
    Capture(#[source] MediaError),

    #[error("Publishing screen share failed: {0}")]
    Publish(#[source] MediaError),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Only {available} camera(s) available, cannot switch")]
    SingleDeviceOnly { available: usize },

    #[error("No camera track is active")]
    NoActiveCamera,

    #[error("Camera switch requires a joined session (phase: {0})")]
    NotJoined(SessionPhase),

    #[error("Camera switch failed: {0}")]
    Switch(#[source] MediaError),
}

/// Errors of local toggles (mute, camera off, local playback)
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Operation requires a joined session (phase: {0})")]
    NotJoined(SessionPhase),

    #[error(transparent)]
    Media(#[from] MediaError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No remote participant {0}")]
    UnknownParticipant(ParticipantId),

    #[error("Subscribing to {kind} of {participant} failed: {source}")]
    Subscribe {
        participant: ParticipantId,
        kind: MediaKind,
        #[source]
        source: MediaError,
    },

    #[error("{kind} of {participant} is not subscribed")]
    NotSubscribed {
        participant: ParticipantId,
        kind: MediaKind,
    },

    #[error("Playback failed: {0}")]
    Playback(#[source] MediaError),

    #[error("Registry worker has stopped")]
    Closed,
}

pub type Result<T> = std::result::Result<T, MediaError>;

/// Run a capability call with an upper bound; overrunning is a `Timeout`
pub(crate) async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(MediaError::Timeout(format!("{what} after {limit:?}"))))
}
