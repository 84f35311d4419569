//! Capture relay: turns a region selection into a durable handoff.
//!
//! The selector cannot rasterize its own surface, so it sends its rectangle here. The relay
//! captures the originating window, writes the screenshot and rectangle into the single-slot
//! store and signals the consuming side to resume. A capture failure ends the workflow quietly:
//! nothing is written and nobody is signalled.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::geometry::SelectionRect;
use crate::handoff::{current_timestamp_ms, CaptureHandoff, HandoffStore, StoreError, PENDING_CAPTURE_KEY};
use crate::system::{CaptureError, SurfaceCapture, SurfaceTarget};

/// Messages the selector sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayMessage {
    RegionSelected { rect: SelectionRect },
}

/// A relay message together with the surface it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEnvelope {
    pub sender: SurfaceTarget,
    pub message: RelayMessage,
}

/// Tells the consuming side that a handoff is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeRequest {
    pub check_pending: bool,
}

#[async_trait]
pub trait ResumeSignal: Send + Sync {
    async fn signal(&self, request: ResumeRequest);
}

#[async_trait]
impl ResumeSignal for mpsc::Sender<ResumeRequest> {
    async fn signal(&self, request: ResumeRequest) {
        if let Err(e) = self.send(request).await {
            warn!(error = %e, "Consumer is gone, resume request dropped");
        }
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Screenshot failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("Failed to store region data: {0}")]
    Store(#[from] StoreError),
}

pub struct CaptureRelay {
    capture: Arc<dyn SurfaceCapture>,
    store: Arc<dyn HandoffStore>,
    resume: Arc<dyn ResumeSignal>,
}

impl CaptureRelay {
    pub fn new(
        capture: Arc<dyn SurfaceCapture>,
        store: Arc<dyn HandoffStore>,
        resume: Arc<dyn ResumeSignal>,
    ) -> Self {
        Self {
            capture,
            store,
            resume,
        }
    }

    /// Processes one message. Errors are already logged when this returns.
    pub async fn handle(&self, envelope: RelayEnvelope) -> Result<CaptureHandoff, RelayError> {
        let RelayEnvelope { sender, message } = envelope;
        let RelayMessage::RegionSelected { rect } = message;
        debug!(tab_id = sender.tab_id, window_id = sender.window_id, ?rect, "Region selection received");

        let raster = match self.capture.capture_visible_surface(sender.window_id).await {
            Ok(raster) => raster,
            Err(e) => {
                error!(error = %e, window_id = sender.window_id, "Screenshot for region failed");
                return Err(e.into());
            }
        };

        let handoff = CaptureHandoff::new(raster, rect, current_timestamp_ms());
        if let Err(e) = self.store.put(PENDING_CAPTURE_KEY, &handoff).await {
            error!(error = %e, "Failed to store region handoff");
            return Err(e.into());
        }
        info!(id = %handoff.id, bytes = handoff.raster_payload.len(), "Region handoff stored");

        self.resume.signal(ResumeRequest { check_pending: true }).await;
        Ok(handoff)
    }

    /// Serves messages until every sender is dropped.
    pub async fn run(self, mut inbox: mpsc::Receiver<RelayEnvelope>) {
        while let Some(envelope) = inbox.recv().await {
            let _ = self.handle(envelope).await;
        }
        debug!("Capture relay stopped");
    }
}
