//! macOS-specific capture using the screencapture command

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::CaptureError;
use crate::paths;
use crate::raster::RasterPayload;

/// Captures a window (or the whole screen for id 0) without sound or interaction.
pub(super) async fn capture_window(window_id: u32) -> Result<RasterPayload, CaptureError> {
    let cache_dir = paths::cache_dir().map_err(CaptureError::CommandExecution)?;
    tokio::fs::create_dir_all(&cache_dir).await?;
    let temp_path = cache_dir.join(format!("surface-{}.png", nanoid::nanoid!(10)));

    debug!(window_id, path = %temp_path.display(), "Capturing surface");

    // -x: no sound, -o: no window shadow, -l: a single window by CGWindowID
    let mut command = Command::new("screencapture");
    command.arg("-x");
    if window_id != 0 {
        command.arg("-o").arg(format!("-l{window_id}"));
    }
    let output = command
        .arg(&temp_path)
        .output()
        .await
        .map_err(|e| CaptureError::CommandExecution(format!("Failed to execute screencapture: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            format!(
                "screencapture failed with exit code {}",
                output.status.code().unwrap_or(-1)
            )
        } else {
            format!("screencapture failed: {}", stderr.trim())
        };
        error!(error = %message, "Surface capture failed");
        // Without screen recording permission screencapture exits non-zero.
        return Err(CaptureError::Denied(message));
    }

    let bytes = tokio::fs::read(&temp_path).await?;
    if let Err(e) = tokio::fs::remove_file(&temp_path).await {
        warn!(error = %e, path = %temp_path.display(), "Failed to remove capture file");
    }

    let payload =
        RasterPayload::from_encoded(bytes).map_err(|e| CaptureError::InvalidImage(e.to_string()))?;
    info!(bytes = payload.len(), window_id, "Surface captured");
    Ok(payload)
}
