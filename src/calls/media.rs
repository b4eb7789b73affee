//! Local media acquisition.

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Which capture devices a call needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub const fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// A granted local media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub id: String,
    pub constraints: MediaConstraints,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("device error: {0}")]
    Device(String),
}

/// Grants access to capture devices.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle, MediaError>;

    /// Give a stream back once a call no longer needs it.
    async fn release(&self, _handle: &MediaHandle) {}
}

/// Shares one stream per set of constraints between concurrent calls.
///
/// The underlying provider is asked again only after every user of a
/// stream has released it.
pub struct SharedMediaProvider {
    inner: Arc<dyn MediaProvider>,
    streams: DashMap<MediaConstraints, (MediaHandle, usize)>,
}

impl SharedMediaProvider {
    pub fn new(inner: Arc<dyn MediaProvider>) -> Self {
        Self {
            inner,
            streams: DashMap::new(),
        }
    }

    pub fn users(&self, constraints: &MediaConstraints) -> usize {
        self.streams
            .get(constraints)
            .map(|entry| entry.1)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MediaProvider for SharedMediaProvider {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle, MediaError> {
        if let Some(mut entry) = self.streams.get_mut(constraints) {
            entry.1 += 1;
            debug!(target: "Call/Media", "reusing stream {} ({} users)", entry.0.id, entry.1);
            return Ok(entry.0.clone());
        }

        let handle = self.inner.acquire(constraints).await?;
        let mut entry = self
            .streams
            .entry(*constraints)
            .or_insert_with(|| (handle.clone(), 0));
        entry.1 += 1;
        Ok(entry.0.clone())
    }

    async fn release(&self, handle: &MediaHandle) {
        let released = {
            let Some(mut entry) = self.streams.get_mut(&handle.constraints) else {
                return;
            };
            entry.1 = entry.1.saturating_sub(1);
            entry.1 == 0
        };
        if released
            && let Some((_, (stream, _))) = self
                .streams
                .remove_if(&handle.constraints, |_, (_, users)| *users == 0)
        {
            debug!(target: "Call/Media", "releasing stream {}", stream.id);
            self.inner.release(&stream).await;
        }
    }
}
