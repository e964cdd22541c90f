//! Camera enumeration and rotation

use std::sync::Arc;
use tracing::{debug, warn};

use crate::device::DeviceProvider;
use crate::error::{DeviceError, Result};
use crate::types::DeviceDescriptor;

/// Stateless query over the device capability. Every call re-enumerates so
/// hot-plugged cameras are seen.
#[derive(Clone)]
pub struct DeviceCatalog {
    devices: Arc<dyn DeviceProvider>,
}

impl DeviceCatalog {
    pub fn new(devices: Arc<dyn DeviceProvider>) -> Self {
        Self { devices }
    }

    pub async fn list_cameras(&self) -> Result<Vec<DeviceDescriptor>> {
        let cameras = self.devices.list_cameras().await?;
        debug!(count = cameras.len(), "Enumerated cameras");
        Ok(cameras)
    }

    /// Enumeration failures count as "no"
    pub async fn has_multiple_cameras(&self) -> bool {
        match self.list_cameras().await {
            Ok(cameras) => cameras.len() > 1,
            Err(e) => {
                warn!(error = %e, "Camera enumeration failed");
                false
            }
        }
    }

    /// Camera following `current` in enumeration order
    pub async fn next_camera(
        &self,
        current: Option<&str>,
    ) -> std::result::Result<DeviceDescriptor, DeviceError> {
        let cameras = self.list_cameras().await.map_err(DeviceError::Switch)?;
        rotate(&cameras, current)
    }
}

fn rotate(
    cameras: &[DeviceDescriptor],
    current: Option<&str>,
) -> std::result::Result<DeviceDescriptor, DeviceError> {
    if cameras.len() < 2 {
        return Err(DeviceError::SingleDeviceOnly {
            available: cameras.len(),
        });
    }

    // Without a known device the track runs on the platform default, which
    // is the first enumerated camera
    let next = match current {
        Some(id) => cameras
            .iter()
            .position(|c| c.device_id == id)
            .map_or(0, |idx| (idx + 1) % cameras.len()),
        None => 1,
    };

    Ok(cameras[next].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDeviceProvider;
    use crate::error::MediaError;

    fn cams(n: usize) -> Vec<DeviceDescriptor> {
        (0..n)
            .map(|i| DeviceDescriptor::new(format!("cam-{i}"), format!("Camera {i}")))
            .collect()
    }

    #[test]
    fn test_rotate_wraps() {
        let cameras = cams(3);
        assert_eq!(rotate(&cameras, Some("cam-0")).unwrap().device_id, "cam-1");
        assert_eq!(rotate(&cameras, Some("cam-2")).unwrap().device_id, "cam-0");
    }

    #[test]
    fn test_rotate_unplugged_current_picks_first() {
        let cameras = cams(2);
        assert_eq!(rotate(&cameras, Some("gone")).unwrap().device_id, "cam-0");
    }

    #[test]
    fn test_rotate_without_device_skips_default() {
        assert_eq!(rotate(&cams(2), None).unwrap().device_id, "cam-1");
        assert_eq!(rotate(&cams(3), None).unwrap().device_id, "cam-1");
    }

    #[test]
    fn test_rotate_needs_two_devices() {
        assert!(matches!(
            rotate(&cams(1), Some("cam-0")),
            Err(DeviceError::SingleDeviceOnly { available: 1 })
        ));
        assert!(matches!(
            rotate(&[], None),
            Err(DeviceError::SingleDeviceOnly { available: 0 })
        ));
    }

    #[tokio::test]
    async fn test_enumerates_on_every_call() {
        let mut devices = MockDeviceProvider::new();
        let mut seq = mockall::Sequence::new();
        devices
            .expect_list_cameras()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(cams(1)));
        devices
            .expect_list_cameras()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(cams(2)));

        let catalog = DeviceCatalog::new(Arc::new(devices));
        assert!(!catalog.has_multiple_cameras().await);
        assert!(catalog.has_multiple_cameras().await);
    }

    #[tokio::test]
    async fn test_enumeration_failure() {
        let mut devices = MockDeviceProvider::new();
        devices
            .expect_list_cameras()
            .returning(|| Err(MediaError::PermissionDenied("camera".into())));

        let catalog = DeviceCatalog::new(Arc::new(devices));
        assert!(!catalog.has_multiple_cameras().await);
        assert!(matches!(
            catalog.next_camera(None).await,
            Err(DeviceError::Switch(MediaError::PermissionDenied(_)))
        ));
    }
}
