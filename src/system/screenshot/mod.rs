//! Surface capture: rasterizes the visible surface of a window into a `RasterPayload`.

#[cfg(target_os = "macos")]
mod macos;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::raster::RasterPayload;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Surface capture not implemented for this platform")]
    Unsupported,
    #[error("Capture of this surface is not permitted: {0}")]
    Denied(String),
    #[error("Failed to execute capture command: {0}")]
    CommandExecution(String),
    #[error("Failed to read captured image: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("Captured data is not an image: {0}")]
    InvalidImage(String),
}

/// Platform primitive that rasterizes whatever a window currently shows.
#[async_trait]
pub trait SurfaceCapture: Send + Sync {
    async fn capture_visible_surface(&self, window_id: u32) -> Result<RasterPayload, CaptureError>;
}

/// Captures through the macOS `screencapture` tool. Window id 0 captures the whole screen.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScreencaptureSurface;

#[async_trait]
impl SurfaceCapture for ScreencaptureSurface {
    async fn capture_visible_surface(&self, window_id: u32) -> Result<RasterPayload, CaptureError> {
        #[cfg(target_os = "macos")]
        {
            macos::capture_window(window_id).await
        }

        #[cfg(not(target_os = "macos"))]
        {
            debug!(window_id, "screencapture is only available on macOS");
            Err(CaptureError::Unsupported)
        }
    }
}

/// Serves an image file as the visible surface of every window.
#[derive(Debug, Clone)]
pub struct FileSurface {
    path: PathBuf,
}

impl FileSurface {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SurfaceCapture for FileSurface {
    async fn capture_visible_surface(&self, window_id: u32) -> Result<RasterPayload, CaptureError> {
        debug!(window_id, path = %self.path.display(), "Reading surface from file");
        let bytes = tokio::fs::read(&self.path).await?;
        let payload = RasterPayload::from_encoded(bytes)
            .map_err(|e| CaptureError::InvalidImage(e.to_string()))?;
        info!(bytes = payload.len(), media_type = payload.media_type(), "Surface captured");
        Ok(payload)
    }
}
