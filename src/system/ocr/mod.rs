//! OCR (Optical Character Recognition) engine interface and the Tesseract backend

mod tesseract;

pub use tesseract::{TesseractEngine, TesseractFactory};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::raster::RasterPayload;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("OCR engine unavailable: {0}")]
    Unavailable(String),
    #[error("Language data not installed: {0}")]
    LanguageUnavailable(String),
    #[error("OCR engine used before initialization")]
    NotInitialized,
    #[error("Text recognition failed: {0}")]
    Recognition(String),
    #[error("OCR engine was terminated")]
    Terminated,
    #[error("OCR engine IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the engine finds its executable and language data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResources {
    pub binary: String,
    /// Tesseract language list, e.g. `eng` or `eng+deu`.
    pub language: String,
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineResources {
    fn default() -> Self {
        Self {
            binary: "tesseract".to_string(),
            language: "eng".to_string(),
            data_dir: None,
        }
    }
}

/// Progress report from the engine: a stage name and a fraction in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineProgress {
    pub status: String,
    pub progress: f32,
}

impl EngineProgress {
    pub fn new(status: impl Into<String>, progress: f32) -> Self {
        Self {
            status: status.into(),
            progress: progress.clamp(0.0, 1.0),
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(EngineProgress) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    pub text: String,
}

/// An OCR worker. `terminate` may be called from any state, concurrently with the other calls,
/// and leaves the instance unusable.
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    async fn initialize(
        &self,
        resources: &EngineResources,
        progress: ProgressCallback,
    ) -> Result<(), EngineError>;

    async fn recognize(&self, image: &RasterPayload) -> Result<EngineOutput, EngineError>;

    async fn terminate(&self) -> Result<(), EngineError>;
}

/// Builds fresh, uninitialized engine instances.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Arc<dyn RecognitionEngine>;
}
