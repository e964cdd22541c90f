//! Telecare real-time media session coordinator
//!
//! Establishes a consultation's audio/video conference over an external
//! transport, manages local capture devices and published tracks, subscribes
//! to remote participants, and mirrors a durable presence roster for display
//! names. Teardown releases everything it acquired.
//!
//! ## Architecture
//!
//! - **`SessionCoordinator`**: per-session state machine and public API
//! - **`LocalMediaController`**: microphone, camera and screen tracks
//! - **`RemoteTrackRegistry`**: remote participants and their subscriptions
//! - **`PresenceSynchronizer`**: presence record and display-name feed
//! - **`DeviceCatalog`**: camera enumeration and rotation
//! - **`SessionDirectory`**: one coordinator per (session, participant)
//!
//! The transport, devices and presence store are capabilities behind traits;
//! [`loopback`] provides in-process implementations of all three.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use telecare_rtc::{Capabilities, CoordinatorConfig, SessionCoordinator};
//!
//! let coordinator = SessionCoordinator::new(CoordinatorConfig::default(), capabilities);
//! coordinator.join("appt-42".into(), "doc-1".into(), "Dr. Silva").await?;
//! coordinator.toggle_screen_share().await?;
//! coordinator.leave().await;
//! ```

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod local;
pub mod loopback;
pub mod manager;
pub mod presence;
pub mod registry;
pub mod state;
pub mod store;
pub mod track;
pub mod transport;
pub mod types;

pub use catalog::DeviceCatalog;
pub use config::{CoordinatorConfig, PresenceSettings};
pub use coordinator::{Capabilities, SessionCoordinator};
pub use device::DeviceProvider;
pub use error::{DeviceError, JoinError, MediaError, RegistryError, ScreenShareError, SessionError};
pub use local::LocalMediaController;
pub use manager::SessionDirectory;
pub use presence::PresenceSynchronizer;
pub use registry::RemoteTrackRegistry;
pub use state::{LocalMediaState, RemoteParticipant, SessionEvent, SessionPhase, SessionState, TrackSummary};
pub use store::{PresenceChange, PresenceStore};
pub use track::{MediaTrack, ScreenCapture, TrackHandle, TrackState};
pub use transport::{Transport, TransportEvent};
pub use types::{DeviceDescriptor, MediaKind, RenderTarget, SessionIdentity, SubscriptionState, TrackSource};
