//! Local capture and publication
//!
//! [`LocalMediaController`] is the only owner of local track handles. It
//! acquires microphone and camera independently, publishes whatever was
//! acquired in one batch, and keeps the camera and screen video from ever
//! being published at the same time.
//!
//! The controller takes `&mut self` everywhere; the coordinator serializes
//! access. Observers read the [`LocalMediaState`] view it maintains.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::DeviceProvider;
use crate::error::{bounded, DeviceError, MediaError, Result, ScreenShareError};
use crate::state::{LocalMediaState, SessionEvent, TrackSummary};
use crate::track::{ScreenCapture, TrackHandle, TrackState};
use crate::transport::Transport;
use crate::types::{DeviceDescriptor, RenderTarget};
use telecare_core::models::TrackId;

#[derive(Default)]
struct LocalTracks {
    mic: Option<TrackHandle>,
    camera: Option<TrackHandle>,
    screen: Option<ScreenCapture>,
    mic_disabled: bool,
    camera_disabled: bool,
    /// Last explicitly selected camera; `None` means platform default
    camera_device: Option<DeviceDescriptor>,
}

/// Handle to a freshly started screen share
pub struct ScreenShareStarted {
    pub track_id: TrackId,
    /// Fires when the capture is ended outside the application
    pub ended: Option<BoxFuture<'static, ()>>,
}

pub struct LocalMediaController {
    devices: Arc<dyn DeviceProvider>,
    transport: Arc<dyn Transport>,
    device_timeout: Duration,
    op_timeout: Duration,
    tracks: LocalTracks,
    view: Arc<RwLock<LocalMediaState>>,
    events: broadcast::Sender<SessionEvent>,
}

impl LocalMediaController {
    pub fn new(
        devices: Arc<dyn DeviceProvider>,
        transport: Arc<dyn Transport>,
        device_timeout: Duration,
        op_timeout: Duration,
        view: Arc<RwLock<LocalMediaState>>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            devices,
            transport,
            device_timeout,
            op_timeout,
            tracks: LocalTracks::default(),
            view,
            events,
        }
    }

    #[must_use]
    pub fn state(&self) -> LocalMediaState {
        self.view.read().clone()
    }

    #[must_use]
    pub fn screen_active(&self) -> bool {
        self.tracks.screen.is_some()
    }

    #[must_use]
    pub fn screen_track_id(&self) -> Option<TrackId> {
        self.tracks
            .screen
            .as_ref()
            .map(|capture| capture.video().id().clone())
    }

    /// Acquire microphone and camera best-effort, then publish the acquired
    /// tracks together. Failures only leave the corresponding slot empty.
    /// When `cancel` fires during acquisition nothing is published and the
    /// acquired tracks are released.
    pub async fn start(&mut self, cancel: &CancellationToken) -> LocalMediaState {
        let (mic, camera) = tokio::join!(
            bounded(
                self.device_timeout,
                "microphone acquisition",
                self.devices.acquire_microphone()
            ),
            bounded(
                self.device_timeout,
                "camera acquisition",
                self.devices.acquire_camera(self.tracks.camera_device.clone())
            ),
        );

        let mic = mic
            .inspect_err(|e| warn!(error = %e, "Microphone unavailable, continuing without audio"))
            .ok();
        let camera = camera
            .inspect_err(|e| warn!(error = %e, "Camera unavailable, continuing without video"))
            .ok();

        let batch: Vec<TrackHandle> = mic.iter().chain(camera.iter()).cloned().collect();
        if cancel.is_cancelled() {
            debug!(tracks = batch.len(), "Start cancelled before publish, releasing tracks");
            for track in &batch {
                track.release();
            }
            self.refresh();
            return self.state();
        }
        if batch.is_empty() {
            warn!("No local tracks acquired, joining receive-only");
            self.refresh();
            return self.state();
        }

        match bounded(
            self.op_timeout,
            "local publish",
            self.transport.publish(&batch),
        )
        .await
        {
            Ok(()) => {
                for track in &batch {
                    if let Err(e) = track.mark_published() {
                        warn!(track_id = %track.id(), error = %e, "Published track was already stopped");
                    }
                }
                self.tracks.mic = mic;
                self.tracks.camera = camera;
                info!(tracks = batch.len(), "Local tracks published");
            }
            Err(e) => {
                warn!(error = %e, "Publishing local tracks failed, releasing them");
                for track in &batch {
                    track.release();
                }
            }
        }

        self.refresh();
        self.state()
    }

    /// Soft mute: the track stays published. Without a microphone track,
    /// enabling acquires and publishes one.
    pub async fn set_mic_enabled(&mut self, enabled: bool) -> Result<()> {
        match &self.tracks.mic {
            Some(mic) => mic.set_enabled(enabled).await?,
            None if enabled => {
                let mic = bounded(
                    self.device_timeout,
                    "microphone acquisition",
                    self.devices.acquire_microphone(),
                )
                .await?;
                self.tracks.mic = Some(self.publish_fresh(mic).await?);
            }
            None => {}
        }

        self.tracks.mic_disabled = !enabled;
        debug!(enabled, "Microphone toggled");
        self.refresh();
        Ok(())
    }

    /// Soft mute for the camera. While a screen share is active only the
    /// flag changes; it decides whether the camera comes back afterwards.
    pub async fn set_camera_enabled(&mut self, enabled: bool) -> Result<()> {
        if self.tracks.screen.is_none() {
            match &self.tracks.camera {
                Some(camera) => camera.set_enabled(enabled).await?,
                None if enabled => {
                    let camera = bounded(
                        self.device_timeout,
                        "camera acquisition",
                        self.devices.acquire_camera(self.tracks.camera_device.clone()),
                    )
                    .await?;
                    self.tracks.camera = Some(self.publish_fresh(camera).await?);
                }
                None => {}
            }
        }

        self.tracks.camera_disabled = !enabled;
        debug!(enabled, screen_active = self.screen_active(), "Camera toggled");
        self.refresh();
        Ok(())
    }

    pub async fn start_screen_share(
        &mut self,
    ) -> std::result::Result<ScreenShareStarted, ScreenShareError> {
        let capture = match bounded(
            self.device_timeout,
            "screen capture",
            self.devices.acquire_screen(),
        )
        .await
        {
            Ok(capture) => capture,
            Err(MediaError::Cancelled) => {
                debug!("Screen picker dismissed");
                return Err(ScreenShareError::Denied);
            }
            Err(e) => return Err(ScreenShareError::Capture(e)),
        };

        // Camera video goes down before screen video goes up
        if let Some(camera) = self.tracks.camera.take() {
            if camera.state() == TrackState::Published {
                if let Err(e) = bounded(
                    self.op_timeout,
                    "camera unpublish",
                    self.transport.unpublish(std::slice::from_ref(&camera)),
                )
                .await
                {
                    capture.release();
                    self.tracks.camera = Some(camera);
                    return Err(ScreenShareError::Publish(e));
                }
                camera.mark_unpublished();
            }
            camera.release();
        }

        let tracks = capture.tracks();
        let published = bounded(
            self.op_timeout,
            "screen publish",
            self.transport.publish(&tracks),
        )
        .await
        .and_then(|()| capture.mark_published());

        if let Err(e) = published {
            warn!(error = %e, "Publishing screen share failed, restoring camera");
            capture.release();
            self.restore_camera().await;
            self.refresh();
            return Err(ScreenShareError::Publish(e));
        }

        let started = ScreenShareStarted {
            track_id: capture.video().id().clone(),
            ended: capture.video().ended(),
        };
        info!(
            track_id = %started.track_id,
            with_audio = matches!(capture, ScreenCapture::VideoAndAudio(..)),
            "Screen share started"
        );

        self.tracks.screen = Some(capture);
        self.refresh();
        Ok(started)
    }

    /// Returns `false` when no share was active
    pub async fn stop_screen_share(&mut self) -> bool {
        let Some(capture) = self.tracks.screen.take() else {
            return false;
        };

        let tracks = capture.tracks();
        if let Err(e) = bounded(
            self.op_timeout,
            "screen unpublish",
            self.transport.unpublish(&tracks),
        )
        .await
        {
            warn!(error = %e, "Unpublishing screen share failed");
        }
        for track in &tracks {
            track.mark_unpublished();
        }
        capture.release();
        info!("Screen share stopped");

        self.restore_camera().await;
        self.refresh();
        true
    }

    /// Swap the device under the active camera track without republishing
    pub async fn switch_camera(
        &mut self,
        device: DeviceDescriptor,
    ) -> std::result::Result<(), DeviceError> {
        let camera = self
            .tracks
            .camera
            .as_ref()
            .ok_or(DeviceError::NoActiveCamera)?;

        bounded(
            self.device_timeout,
            "camera switch",
            camera.set_device(&device),
        )
        .await
        .map_err(DeviceError::Switch)?;

        info!(track_id = %camera.id(), device_id = %device.device_id, "Camera switched");
        self.tracks.camera_device = Some(device);
        self.refresh();
        Ok(())
    }

    #[must_use]
    pub fn active_camera_device_id(&self) -> Option<String> {
        self.tracks
            .camera
            .as_ref()
            .and_then(TrackHandle::device_id)
            .or_else(|| {
                self.tracks
                    .camera_device
                    .as_ref()
                    .map(|d| d.device_id.clone())
            })
    }

    pub fn play_camera(&self, target: &RenderTarget) -> Result<()> {
        self.tracks
            .camera
            .as_ref()
            .ok_or_else(|| MediaError::NotFound("no local camera track".to_string()))?
            .play(target)
    }

    pub fn play_screen(&self, target: &RenderTarget) -> Result<()> {
        self.tracks
            .screen
            .as_ref()
            .ok_or_else(|| MediaError::NotFound("no active screen share".to_string()))?
            .video()
            .play(target)
    }

    /// Release every local track. Never fails; errors are logged.
    pub async fn shutdown(&mut self) {
        let tracks = std::mem::take(&mut self.tracks);

        for track in tracks.mic.iter().chain(tracks.camera.iter()) {
            track.release();
        }

        if let Some(capture) = tracks.screen {
            capture.release();
            if let Err(e) = bounded(
                self.op_timeout,
                "screen unpublish",
                self.transport.unpublish(&capture.tracks()),
            )
            .await
            {
                warn!(error = %e, "Unpublishing screen share during shutdown failed");
            }
        }

        debug!("Local media shut down");
        self.refresh();
    }

    async fn restore_camera(&mut self) {
        if self.tracks.camera_disabled || self.tracks.camera.is_some() {
            return;
        }

        let camera = match bounded(
            self.device_timeout,
            "camera acquisition",
            self.devices.acquire_camera(self.tracks.camera_device.clone()),
        )
        .await
        {
            Ok(camera) => camera,
            Err(e) => {
                warn!(error = %e, "Camera could not be restored");
                return;
            }
        };

        match self.publish_fresh(camera).await {
            Ok(camera) => {
                info!(track_id = %camera.id(), "Camera restored");
                self.tracks.camera = Some(camera);
            }
            Err(e) => warn!(error = %e, "Restored camera could not be published"),
        }
    }

    async fn publish_fresh(&self, track: TrackHandle) -> Result<TrackHandle> {
        if let Err(e) = bounded(
            self.op_timeout,
            "publish",
            self.transport.publish(std::slice::from_ref(&track)),
        )
        .await
        {
            track.release();
            return Err(e);
        }
        track.mark_published()?;
        Ok(track)
    }

    fn refresh(&self) {
        let state = LocalMediaState {
            mic: self.tracks.mic.as_ref().map(TrackSummary::from),
            camera: self.tracks.camera.as_ref().map(TrackSummary::from),
            screen: self
                .tracks
                .screen
                .as_ref()
                .map(|capture| TrackSummary::from(capture.video())),
            mic_enabled: !self.tracks.mic_disabled,
            camera_enabled: !self.tracks.camera_disabled,
            screen_active: self.tracks.screen.is_some(),
        };

        {
            let mut view = self.view.write();
            if *view == state {
                return;
            }
            *view = state.clone();
        }
        let _ = self.events.send(SessionEvent::LocalMediaChanged { local: state });
    }
}
