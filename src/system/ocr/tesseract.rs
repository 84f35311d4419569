//! Tesseract backend driving the `tesseract` command line tool.
//!
//! The image goes in over stdin and the text comes back on stdout, so no temporary files are
//! needed. Terminating the engine kills a running child process.

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{
    EngineError, EngineFactory, EngineOutput, EngineProgress, EngineResources, ProgressCallback,
    RecognitionEngine,
};
use crate::raster::RasterPayload;

const STAGE_CORE: &str = "loading tesseract core";
const STAGE_LANGUAGE: &str = "loading language traineddata";
const STAGE_API: &str = "initialized api";
const STAGE_RECOGNIZE: &str = "recognizing text";

struct Initialized {
    resources: EngineResources,
    progress: ProgressCallback,
}

pub struct TesseractEngine {
    state: Mutex<Option<Initialized>>,
    terminated: watch::Sender<bool>,
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TesseractEngine {
    pub fn new() -> Self {
        let (terminated, _) = watch::channel(false);
        Self {
            state: Mutex::new(None),
            terminated,
        }
    }

    fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    /// Resolves once `terminate` has been called.
    fn terminated_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.terminated.subscribe();
        async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    fn base_command(resources: &EngineResources) -> Command {
        let mut command = Command::new(&resources.binary);
        if let Some(dir) = &resources.data_dir {
            command.arg("--tessdata-dir").arg(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn check_install(resources: &EngineResources, progress: &ProgressCallback) -> Result<(), EngineError> {
        progress(EngineProgress::new(STAGE_CORE, 0.0));
        let version = Command::new(&resources.binary)
            .arg("--version")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::Unavailable(format!("{}: {e}", resources.binary)))?;
        if !version.status.success() {
            return Err(EngineError::Unavailable(format!(
                "{} --version exited with {}",
                resources.binary, version.status
            )));
        }
        progress(EngineProgress::new(STAGE_CORE, 1.0));

        progress(EngineProgress::new(STAGE_LANGUAGE, 0.0));
        let listing = Self::base_command(resources)
            .arg("--list-langs")
            .output()
            .await?;
        // Older releases print the list on stderr.
        let mut text = String::from_utf8_lossy(&listing.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&listing.stderr));
        let installed = parse_language_list(&text);
        debug!(installed = installed.len(), "Tesseract languages listed");

        if let Some(missing) = resources
            .language
            .split('+')
            .map(str::trim)
            .find(|lang| !installed.iter().any(|l| l == lang))
        {
            return Err(EngineError::LanguageUnavailable(missing.to_string()));
        }
        progress(EngineProgress::new(STAGE_LANGUAGE, 1.0));
        progress(EngineProgress::new(STAGE_API, 1.0));
        Ok(())
    }

    async fn run_recognition(
        resources: EngineResources,
        image: RasterPayload,
    ) -> Result<EngineOutput, EngineError> {
        let mut child = Self::base_command(&resources)
            .arg("stdin")
            .arg("stdout")
            .arg("-l")
            .arg(&resources.language)
            .stdin(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(image.bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Recognition(if stderr.trim().is_empty() {
                format!("tesseract exited with {}", output.status)
            } else {
                stderr.trim().to_string()
            }));
        }

        Ok(EngineOutput {
            text: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

/// Language codes from `tesseract --list-langs` output, skipping the header line.
fn parse_language_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains(' ') && !line.ends_with(':'))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl RecognitionEngine for TesseractEngine {
    async fn initialize(
        &self,
        resources: &EngineResources,
        progress: ProgressCallback,
    ) -> Result<(), EngineError> {
        if self.is_terminated() {
            return Err(EngineError::Terminated);
        }

        let terminated = self.terminated_signal();
        tokio::select! {
            result = Self::check_install(resources, &progress) => result?,
            _ = terminated => return Err(EngineError::Terminated),
        }

        info!(language = %resources.language, "Tesseract initialized");
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(Initialized {
            resources: resources.clone(),
            progress,
        });
        Ok(())
    }

    async fn recognize(&self, image: &RasterPayload) -> Result<EngineOutput, EngineError> {
        if self.is_terminated() {
            return Err(EngineError::Terminated);
        }
        let (resources, progress) = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let initialized = state.as_ref().ok_or(EngineError::NotInitialized)?;
            (initialized.resources.clone(), Arc::clone(&initialized.progress))
        };

        debug!(bytes = image.len(), "Running tesseract");
        progress(EngineProgress::new(STAGE_RECOGNIZE, 0.0));
        let terminated = self.terminated_signal();
        let output = tokio::select! {
            result = Self::run_recognition(resources, image.clone()) => result?,
            // Dropping the recognition future kills the child.
            _ = terminated => return Err(EngineError::Terminated),
        };
        progress(EngineProgress::new(STAGE_RECOGNIZE, 1.0));
        info!(chars = output.text.len(), "Tesseract finished");
        Ok(output)
    }

    async fn terminate(&self) -> Result<(), EngineError> {
        if !self.terminated.send_replace(true) {
            debug!("Tesseract engine terminated");
        }
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

/// Creates `TesseractEngine` instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct TesseractFactory;

impl EngineFactory for TesseractFactory {
    fn create(&self) -> Arc<dyn RecognitionEngine> {
        Arc::new(TesseractEngine::new())
    }
}
