pub mod id;
pub mod presence;

pub use id::{generate_id, ParticipantId, SessionId, TrackId};
pub use presence::{PresenceKey, PresenceRecord, RoomRecord};
