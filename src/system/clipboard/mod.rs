//! Clipboard sink for recognized text.
//!
//! System clipboard writes can block (e.g. on X11 while another client holds the selection), so
//! the write runs on a blocking thread with a timeout. The `arboard` handle lives as long as the
//! sink: on Linux the selection is only served while a handle exists.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arboard::Clipboard;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Max time we wait for the system clipboard to accept text before giving up.
const CLIPBOARD_WRITE_TIMEOUT_MS: u64 = 1200;

#[derive(Error, Debug)]
pub enum ClipboardError {
    #[error("Clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("Clipboard write failed: {0}")]
    Write(String),
    #[error("Clipboard write timed out")]
    Timeout,
}

#[async_trait]
pub trait ClipboardSink: Send + Sync {
    async fn write_text(&self, text: &str) -> Result<(), ClipboardError>;
}

/// The host clipboard, through `arboard`.
#[derive(Default)]
pub struct SystemClipboard {
    handle: Arc<Mutex<Option<Clipboard>>>,
}

impl SystemClipboard {
    pub fn new() -> Self {
        Self::default()
    }
}

fn write_blocking(slot: &Mutex<Option<Clipboard>>, text: String) -> Result<(), ClipboardError> {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(Clipboard::new().map_err(|e| ClipboardError::Unavailable(e.to_string()))?);
    }
    let Some(clipboard) = slot.as_mut() else {
        return Err(ClipboardError::Unavailable("no clipboard handle".into()));
    };
    clipboard
        .set_text(text)
        .map_err(|e| ClipboardError::Write(e.to_string()))
}

#[async_trait]
impl ClipboardSink for SystemClipboard {
    async fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        let handle = Arc::clone(&self.handle);
        let text = text.to_string();
        let len = text.len();
        let task = tokio::task::spawn_blocking(move || write_blocking(&handle, text));

        match tokio::time::timeout(Duration::from_millis(CLIPBOARD_WRITE_TIMEOUT_MS), task).await {
            Ok(Ok(Ok(()))) => {
                // Logs only length to avoid leaking recognized content into logs.
                debug!(len, "Copied text to clipboard");
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "Clipboard write failed");
                Err(e)
            }
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "Clipboard worker failed");
                Err(ClipboardError::Write(join_err.to_string()))
            }
            Err(_) => {
                warn!(timeout_ms = CLIPBOARD_WRITE_TIMEOUT_MS, "Clipboard write timed out");
                Err(ClipboardError::Timeout)
            }
        }
    }
}
