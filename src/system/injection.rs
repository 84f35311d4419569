//! Injection of the region selector into a surface.
//!
//! Browser-internal and extension-internal pages refuse script injection, so callers check the
//! URL with `ensure_injectable` before asking the host to inject.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::SurfaceTarget;
use crate::relay::RelayEnvelope;
use crate::selector::{HeadlessOverlay, PointerEvent, RegionSelector, Viewport};

const RESTRICTED_URL_PREFIXES: &[&str] = &[
    "chrome://",
    "chrome-extension://",
    "chrome-search://",
    "edge://",
    "brave://",
    "about:",
    "moz-extension://",
    "devtools://",
    "view-source:",
    "https://chrome.google.com/webstore",
    "https://chromewebstore.google.com",
];

#[derive(Error, Debug)]
pub enum InjectionError {
    #[error("Cannot select a region on this page ({0})")]
    RestrictedUrl(String),
    #[error("Failed to inject region selector: {0}")]
    Failed(String),
}

/// Rejects URLs whose scheme or host forbids injected scripts.
pub fn ensure_injectable(url: &str) -> Result<(), InjectionError> {
    let lowered = url.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return Err(InjectionError::RestrictedUrl("no page URL".into()));
    }
    if let Some(prefix) = RESTRICTED_URL_PREFIXES
        .iter()
        .find(|prefix| lowered.starts_with(*prefix))
    {
        debug!(url, prefix, "Refusing to inject into restricted page");
        return Err(InjectionError::RestrictedUrl(url.trim().to_string()));
    }
    Ok(())
}

/// Host primitive that starts a region selector inside a surface.
#[async_trait]
pub trait SelectorInjector: Send + Sync {
    async fn inject(&self, target: &SurfaceTarget) -> Result<(), InjectionError>;
}

/// Runs a selector on a headless overlay and replays a recorded pointer script into it.
pub struct ScriptedInjector {
    viewport: Viewport,
    script: Vec<PointerEvent>,
    active: Arc<AtomicBool>,
    outbox: mpsc::Sender<RelayEnvelope>,
}

impl ScriptedInjector {
    pub fn new(
        viewport: Viewport,
        script: Vec<PointerEvent>,
        outbox: mpsc::Sender<RelayEnvelope>,
    ) -> Self {
        Self {
            viewport,
            script,
            active: Arc::new(AtomicBool::new(false)),
            outbox,
        }
    }
}

#[async_trait]
impl SelectorInjector for ScriptedInjector {
    async fn inject(&self, target: &SurfaceTarget) -> Result<(), InjectionError> {
        let Some(mut selector) = RegionSelector::activate(
            HeadlessOverlay::new(self.viewport),
            Arc::clone(&self.active),
            target.clone(),
            self.outbox.clone(),
        ) else {
            return Ok(());
        };

        for event in &self.script {
            selector.handle_event(*event);
            if selector.is_finished() {
                break;
            }
        }
        info!(state = ?selector.state(), "Scripted selection finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Point, SelectionRect};
    use crate::relay::RelayMessage;

    #[test]
    fn test_restricted_schemes_are_rejected() {
        for url in [
            "chrome://settings",
            "chrome-extension://abc/popup.html",
            "edge://flags",
            "about:blank",
            "moz-extension://x/y",
            "  CHROME://history",
            "",
        ] {
            assert!(
                matches!(ensure_injectable(url), Err(InjectionError::RestrictedUrl(_))),
                "{url} should be restricted"
            );
        }
    }

    #[test]
    fn test_regular_pages_are_injectable() {
        for url in ["https://example.com/", "http://localhost:8080", "file:///tmp/a.html"] {
            assert!(ensure_injectable(url).is_ok(), "{url} should be injectable");
        }
    }

    #[tokio::test]
    async fn test_scripted_injector_emits_selection() {
        let (tx, mut rx) = mpsc::channel(1);
        let injector = ScriptedInjector::new(
            Viewport {
                width: 400.0,
                height: 300.0,
                device_pixel_ratio: 2.0,
            },
            vec![
                PointerEvent::Down(Point::new(10.0, 10.0)),
                PointerEvent::Move(Point::new(60.0, 40.0)),
                PointerEvent::Up(Point::new(60.0, 40.0)),
            ],
            tx,
        );
        let target = SurfaceTarget {
            tab_id: 1,
            window_id: 1,
            url: "https://example.com/".into(),
        };

        injector.inject(&target).await.unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(
            envelope.message,
            RelayMessage::RegionSelected {
                rect: SelectionRect::new(20, 20, 100, 60)
            }
        );
    }
}
