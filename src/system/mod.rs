//! Host interactions (surface capture, selector injection, clipboard, OCR engine)

mod clipboard;
mod injection;
mod ocr;
mod screenshot;

use serde::{Deserialize, Serialize};

pub use clipboard::{ClipboardError, ClipboardSink, SystemClipboard};
pub use injection::{ensure_injectable, InjectionError, ScriptedInjector, SelectorInjector};
pub use ocr::{
    EngineError, EngineFactory, EngineOutput, EngineProgress, EngineResources, ProgressCallback,
    RecognitionEngine, TesseractEngine, TesseractFactory,
};
pub use screenshot::{CaptureError, FileSurface, ScreencaptureSurface, SurfaceCapture};

/// Identifies the tab (and its window) a request concerns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceTarget {
    pub tab_id: u32,
    pub window_id: u32,
    pub url: String,
}
