//! Local and remote media tracks, and the capture seam that produces them.

use std::fmt;

use async_trait::async_trait;

use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Where a local track was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    Display,
}

impl TrackSource {
    pub fn kind(self) -> MediaKind {
        match self {
            TrackSource::Microphone => MediaKind::Audio,
            TrackSource::Camera | TrackSource::Display => MediaKind::Video,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub source: TrackSource,
    pub enabled: bool,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, source: TrackSource) -> Self {
        Self {
            id: id.into(),
            source,
            enabled: true,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.source.kind()
    }
}

/// A track the remote peer is sending us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Camera, microphone and screen capture.
#[async_trait]
pub trait MediaSource: Send {
    /// Microphone plus camera.
    async fn acquire_user_media(&mut self) -> Result<Vec<LocalTrack>, DeviceError>;

    async fn acquire_display_media(&mut self) -> Result<LocalTrack, DeviceError>;

    fn set_enabled(&mut self, track: &LocalTrack, enabled: bool);

    /// Stop capturing. Called exactly once for every track handed out.
    fn release(&mut self, track: &LocalTrack);
}
