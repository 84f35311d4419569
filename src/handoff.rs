//! Single-slot durable handoff between the capture relay and the recognition controller.
//!
//! The relay writes a `CaptureHandoff` under `PENDING_CAPTURE_KEY` (overwriting any earlier
//! value); the controller reads it at most once and deletes it right after the read. Records
//! older than the freshness window are discarded unprocessed.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::geometry::SelectionRect;
use crate::raster::RasterPayload;

/// Key the relay writes its handoff under.
pub const PENDING_CAPTURE_KEY: &str = "pendingRegionCapture";

/// How long a handoff stays usable after capture.
pub const DEFAULT_HANDOFF_TTL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("Region data expired ({age_ms} ms old)")]
    Expired { age_ms: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A screenshot plus the selection it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureHandoff {
    pub id: String,
    pub raster_payload: RasterPayload,
    pub rect: SelectionRect,
    /// Milliseconds since the Unix epoch.
    pub captured_at: u64,
}

impl CaptureHandoff {
    pub fn new(raster_payload: RasterPayload, rect: SelectionRect, captured_at: u64) -> Self {
        Self {
            id: nanoid::nanoid!(10),
            raster_payload,
            rect,
            captured_at,
        }
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.captured_at)
    }

    pub fn is_fresh(&self, now_ms: u64, ttl: Duration) -> bool {
        u128::from(self.age_ms(now_ms)) <= ttl.as_millis()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Durable key/value slot the handoff travels through.
#[async_trait]
pub trait HandoffStore: Send + Sync {
    async fn put(&self, key: &str, value: &CaptureHandoff) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<CaptureHandoff>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Reads and deletes the pending handoff.
///
/// Returns `Ok(None)` when nothing is pending and `HandoffError::Expired` when the record is
/// older than `ttl`. The slot is emptied in the fresh and expired cases, and when the record
/// cannot be decoded.
pub async fn take_pending(
    store: &dyn HandoffStore,
    now_ms: u64,
    ttl: Duration,
) -> Result<Option<CaptureHandoff>, HandoffError> {
    let handoff = match store.get(PENDING_CAPTURE_KEY).await {
        Ok(Some(handoff)) => handoff,
        Ok(None) => {
            debug!("No pending handoff");
            return Ok(None);
        }
        Err(StoreError::Json(e)) => {
            warn!(error = %e, "Discarding unreadable handoff");
            if let Err(e) = store.delete(PENDING_CAPTURE_KEY).await {
                warn!(error = %e, "Failed to delete unreadable handoff");
            }
            return Err(StoreError::Json(e).into());
        }
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = store.delete(PENDING_CAPTURE_KEY).await {
        warn!(error = %e, id = %handoff.id, "Failed to delete handoff after read");
    }

    let age_ms = handoff.age_ms(now_ms);
    if !handoff.is_fresh(now_ms, ttl) {
        info!(id = %handoff.id, age_ms, "Discarding expired handoff");
        return Err(HandoffError::Expired { age_ms });
    }

    debug!(id = %handoff.id, age_ms, rect = ?handoff.rect, "Took pending handoff");
    Ok(Some(handoff))
}

/// In-process store, for a relay and controller living in the same process.
#[derive(Default)]
pub struct MemoryHandoffStore {
    slots: Mutex<HashMap<String, CaptureHandoff>>,
}

impl MemoryHandoffStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HandoffStore for MemoryHandoffStore {
    async fn put(&self, key: &str, value: &CaptureHandoff) -> Result<(), StoreError> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CaptureHandoff>, StoreError> {
        Ok(self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Store backed by one JSON file per key, so a handoff survives a process restart.
pub struct FileHandoffStore {
    dir: PathBuf,
}

impl FileHandoffStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl HandoffStore for FileHandoffStore {
    async fn put(&self, key: &str, value: &CaptureHandoff) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec(value)?;
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), bytes = data.len(), "Handoff written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CaptureHandoff>, StoreError> {
        let path = self.path_for(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
