//! Track handles
//!
//! A [`TrackHandle`] wraps a capability-provided [`MediaTrack`] and tracks its
//! lifecycle: `Acquired -> Published -> Acquired ... -> Stopped`. A stopped
//! handle cannot be published, enabled, or played again; a fresh one must be
//! acquired from the device capability.

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{MediaError, Result};
use crate::types::{DeviceDescriptor, MediaKind, RenderTarget, TrackSource};
use telecare_core::models::TrackId;

/// Lifecycle state of a track handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Acquired,
    Published,
    Stopped,
}

/// A single media stream as exposed by the device or transport capability
#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> MediaKind;

    fn source(&self) -> TrackSource;

    /// Device currently feeding the track, if it is device bound
    fn device_id(&self) -> Option<String> {
        None
    }

    /// Transport-level soft mute; the track stays published
    async fn set_enabled(&self, enabled: bool) -> Result<()>;

    /// Swap the capture device underneath a video track
    async fn set_device(&self, _device: &DeviceDescriptor) -> Result<()> {
        Err(MediaError::Unsupported(format!(
            "{:?} track cannot change device",
            self.source()
        )))
    }

    fn play(&self, target: &RenderTarget) -> Result<()>;

    fn stop(&self);

    fn close(&self);

    /// Resolves when the capture is ended outside the application
    /// (e.g. the operating system's "stop sharing" control). Timing is
    /// best effort.
    fn ended(&self) -> Option<BoxFuture<'static, ()>> {
        None
    }
}

/// Shared handle over an acquired track
#[derive(Clone)]
pub struct TrackHandle {
    id: TrackId,
    track: Arc<dyn MediaTrack>,
    state: Arc<Mutex<TrackState>>,
}

impl TrackHandle {
    pub fn new(track: Arc<dyn MediaTrack>) -> Self {
        Self {
            id: TrackId::new(),
            track,
            state: Arc::new(Mutex::new(TrackState::Acquired)),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.track.kind()
    }

    #[must_use]
    pub fn source(&self) -> TrackSource {
        self.track.source()
    }

    #[must_use]
    pub fn device_id(&self) -> Option<String> {
        self.track.device_id()
    }

    #[must_use]
    pub fn state(&self) -> TrackState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state() == TrackState::Stopped
    }

    /// Whether both handles refer to the same acquired track
    #[must_use]
    pub fn same_track(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn play(&self, target: &RenderTarget) -> Result<()> {
        self.ensure_live()?;
        self.track.play(target)
    }

    #[must_use]
    pub fn ended(&self) -> Option<BoxFuture<'static, ()>> {
        self.track.ended()
    }

    pub(crate) async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.ensure_live()?;
        self.track.set_enabled(enabled).await
    }

    pub(crate) async fn set_device(&self, device: &DeviceDescriptor) -> Result<()> {
        self.ensure_live()?;
        self.track.set_device(device).await
    }

    pub(crate) fn mark_published(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            TrackState::Stopped => Err(MediaError::TrackStopped),
            _ => {
                *state = TrackState::Published;
                Ok(())
            }
        }
    }

    pub(crate) fn mark_unpublished(&self) {
        let mut state = self.state.lock();
        if *state == TrackState::Published {
            *state = TrackState::Acquired;
        }
    }

    /// Stop and close the underlying track. Idempotent.
    pub(crate) fn release(&self) {
        {
            let mut state = self.state.lock();
            if *state == TrackState::Stopped {
                return;
            }
            *state = TrackState::Stopped;
        }
        self.track.stop();
        self.track.close();
        debug!(track_id = %self.id, source = ?self.source(), "Track released");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_stopped() {
            Err(MediaError::TrackStopped)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for TrackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackHandle")
            .field("id", &self.id)
            .field("source", &self.source())
            .field("state", &self.state())
            .finish()
    }
}

/// Local screen capture; some platforms deliver system audio alongside video
#[derive(Debug, Clone)]
pub enum ScreenCapture {
    VideoOnly(TrackHandle),
    VideoAndAudio(TrackHandle, TrackHandle),
}

impl ScreenCapture {
    #[must_use]
    pub const fn video(&self) -> &TrackHandle {
        match self {
            Self::VideoOnly(video) | Self::VideoAndAudio(video, _) => video,
        }
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<TrackHandle> {
        match self {
            Self::VideoOnly(video) => vec![video.clone()],
            Self::VideoAndAudio(video, audio) => vec![video.clone(), audio.clone()],
        }
    }

    pub(crate) fn mark_published(&self) -> Result<()> {
        match self {
            Self::VideoOnly(video) => video.mark_published(),
            Self::VideoAndAudio(video, audio) => {
                video.mark_published()?;
                audio.mark_published()
            }
        }
    }

    pub(crate) fn release(&self) {
        match self {
            Self::VideoOnly(video) => video.release(),
            Self::VideoAndAudio(video, audio) => {
                video.release();
                audio.release();
            }
        }
    }
}
