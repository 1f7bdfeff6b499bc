use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// A bundle of tracks, either captured locally or received from the remote peer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        MediaStream {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, id: impl Into<String>, kind: TrackKind) -> Self {
        self.tracks.push(MediaTrack {
            id: id.into(),
            kind,
        });
        self
    }
}

/// What to capture.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        MediaConstraints {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to acquire local media: {reason}")]
pub struct MediaAcquisitionError {
    pub reason: String,
}

impl MediaAcquisitionError {
    pub fn new(reason: impl Into<String>) -> Self {
        MediaAcquisitionError {
            reason: reason.into(),
        }
    }
}

/// Camera / microphone capture.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaAcquisitionError>;
}
