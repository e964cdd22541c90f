//! Capture device capability

use async_trait::async_trait;

use crate::error::Result;
use crate::track::{ScreenCapture, TrackHandle};
use crate::types::DeviceDescriptor;

/// Enumerates cameras and acquires local tracks
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    async fn list_cameras(&self) -> Result<Vec<DeviceDescriptor>>;

    async fn acquire_microphone(&self) -> Result<TrackHandle>;

    /// `None` selects the platform default camera
    async fn acquire_camera(&self, device: Option<DeviceDescriptor>) -> Result<TrackHandle>;

    /// Opens the screen picker. A dismissed picker yields
    /// [`MediaError::Cancelled`](crate::error::MediaError::Cancelled).
    async fn acquire_screen(&self) -> Result<ScreenCapture>;
}
