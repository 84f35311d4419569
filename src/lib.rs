pub mod config;
pub mod geometry;
pub mod handoff;
pub mod paths;
pub mod raster;
pub mod recognition;
pub mod relay;
pub mod selector;
pub mod system;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, Settings};
use crate::geometry::Point;
use crate::handoff::{FileHandoffStore, HandoffStore};
use crate::raster::{decode_image_dimensions, ImageError, RasterPayload};
use crate::recognition::{
    ControllerError, ControllerOptions, HostServices, RecognitionController, RecognitionResult,
};
use crate::relay::{CaptureRelay, RelayEnvelope, RelayError, ResumeRequest};
use crate::selector::{PointerEvent, Viewport};
use crate::system::{
    CaptureError, ClipboardSink, FileSurface, InjectionError, ScriptedInjector, SelectorInjector,
    SurfaceCapture, SurfaceTarget, SystemClipboard, TesseractFactory,
};

pub const USAGE: &str = "Usage:
  tab-ocr full <image>
  tab-ocr select <image> <x1> <y1> <x2> <y2> [--dpr <ratio>]
  tab-ocr resume
  tab-ocr init-config";

/// A parsed command line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Recognize the whole image.
    Full { image: PathBuf },
    /// Drag from `from` to `to` (CSS pixels) over the image and recognize the selection.
    Select {
        image: PathBuf,
        from: Point,
        to: Point,
        device_pixel_ratio: f64,
    },
    /// Recognize a selection left in the handoff store by an earlier run.
    Resume,
    InitConfig,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to read {path}: {source}")]
    ReadImage {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("No cache directory: {0}")]
    CacheDir(String),
    #[error("Failed to start async runtime: {0}")]
    Runtime(std::io::Error),
}

fn parse_number(name: &str, value: Option<&String>) -> Result<f64, String> {
    let value = value.ok_or_else(|| format!("missing <{name}>"))?;
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("<{name}> must be a number, got {value:?}"))
}

/// Parses the arguments after the program name.
pub fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some((command, rest)) = args.split_first() else {
        return Err("missing command".into());
    };

    match command.as_str() {
        "full" => match rest {
            [image] => Ok(Command::Full {
                image: PathBuf::from(image),
            }),
            _ => Err("full takes exactly one <image>".into()),
        },
        "select" => {
            let image = rest.first().ok_or("missing <image>")?;
            let from = Point::new(
                parse_number("x1", rest.get(1))?,
                parse_number("y1", rest.get(2))?,
            );
            let to = Point::new(
                parse_number("x2", rest.get(3))?,
                parse_number("y2", rest.get(4))?,
            );
            let device_pixel_ratio = match &rest[5.min(rest.len())..] {
                [] => 1.0,
                [flag, value] if flag == "--dpr" => {
                    let ratio = parse_number("ratio", Some(value))?;
                    if ratio <= 0.0 {
                        return Err("<ratio> must be positive".into());
                    }
                    ratio
                }
                other => return Err(format!("unexpected arguments: {}", other.join(" "))),
            };
            Ok(Command::Select {
                image: PathBuf::from(image),
                from,
                to,
                device_pixel_ratio,
            })
        }
        "resume" if rest.is_empty() => Ok(Command::Resume),
        "init-config" if rest.is_empty() => Ok(Command::InitConfig),
        "resume" | "init-config" => Err(format!("{command} takes no arguments")),
        other => Err(format!("unknown command {other:?}")),
    }
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn handoff_store() -> Result<Arc<FileHandoffStore>, AppError> {
    let dir = paths::cache_dir().map_err(AppError::CacheDir)?;
    Ok(Arc::new(FileHandoffStore::new(dir)))
}

/// Stand-in host for commands that neither capture nor select.
struct Detached;

#[async_trait::async_trait]
impl SelectorInjector for Detached {
    async fn inject(&self, _target: &SurfaceTarget) -> Result<(), InjectionError> {
        Err(InjectionError::Failed(
            "region selection needs the select command".into(),
        ))
    }
}

#[async_trait::async_trait]
impl SurfaceCapture for Detached {
    async fn capture_visible_surface(&self, _window_id: u32) -> Result<RasterPayload, CaptureError> {
        Err(CaptureError::Unsupported)
    }
}

fn build_controller(
    settings: &Settings,
    capture: Arc<dyn SurfaceCapture>,
    injector: Arc<dyn SelectorInjector>,
    store: Arc<dyn HandoffStore>,
) -> Arc<RecognitionController> {
    let clipboard: Arc<dyn ClipboardSink> = Arc::new(SystemClipboard::new());
    Arc::new(RecognitionController::new(
        Arc::new(TesseractFactory),
        HostServices {
            capture,
            injector,
            store,
            clipboard,
        },
        ControllerOptions::from(settings),
    ))
}

/// Runs `pipeline`, cancelling the controller on Ctrl-C. Status changes go to stderr.
async fn drive<F>(
    controller: Arc<RecognitionController>,
    pipeline: F,
) -> Result<Option<RecognitionResult>, AppError>
where
    F: std::future::Future<Output = Result<Option<RecognitionResult>, AppError>>,
{
    let mut status_rx = controller.subscribe_status();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let reporter = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = status_rx.borrow_and_update().to_string();
                    eprintln!("{status}");
                }
                _ = &mut stop_rx => break,
            }
        }
    });

    let outcome = tokio::select! {
        outcome = pipeline => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            controller.cancel().await;
            Err(ControllerError::Cancelled.into())
        }
    };

    controller.shutdown().await;
    let _ = stop_tx.send(());
    if let Err(e) = reporter.await {
        warn!(error = %e, "Status reporter failed");
    }
    outcome
}

async fn run_full(settings: &Settings, image: PathBuf) -> Result<Option<RecognitionResult>, AppError> {
    let controller = build_controller(
        settings,
        Arc::new(FileSurface::new(image)),
        Arc::new(Detached),
        handoff_store()?,
    );
    let pipeline = {
        let controller = Arc::clone(&controller);
        async move {
            controller
                .run_full_capture(0)
                .await
                .map(Some)
                .map_err(AppError::from)
        }
    };
    drive(controller, pipeline).await
}

async fn run_select(
    settings: &Settings,
    image: PathBuf,
    from: Point,
    to: Point,
    device_pixel_ratio: f64,
) -> Result<Option<RecognitionResult>, AppError> {
    let bytes = tokio::fs::read(&image)
        .await
        .map_err(|source| AppError::ReadImage {
            path: image.clone(),
            source,
        })?;
    let dimensions = decode_image_dimensions(&RasterPayload::from_encoded(bytes)?)?;
    let viewport = Viewport {
        width: f64::from(dimensions.width) / device_pixel_ratio,
        height: f64::from(dimensions.height) / device_pixel_ratio,
        device_pixel_ratio,
    };
    debug!(?viewport, "Viewport derived from image");

    let store = handoff_store()?;
    let surface: Arc<dyn SurfaceCapture> = Arc::new(FileSurface::new(image.clone()));
    let (relay_tx, mut relay_rx) = mpsc::channel(1);
    let (resume_tx, mut resume_rx) = mpsc::channel(1);
    let relay = CaptureRelay::new(Arc::clone(&surface), store.clone(), Arc::new(resume_tx));
    let injector = ScriptedInjector::new(
        viewport,
        vec![
            PointerEvent::Down(from),
            PointerEvent::Move(to),
            PointerEvent::Up(to),
        ],
        relay_tx,
    );
    let controller = build_controller(settings, surface, Arc::new(injector), store);

    let target = SurfaceTarget {
        tab_id: 1,
        window_id: 0,
        url: format!("file://{}", image.display()),
    };
    let pipeline = {
        let controller = Arc::clone(&controller);
        async move { select_region(&controller, &relay, &target, relay_rx, resume_rx).await }
    };
    drive(controller, pipeline).await
}

/// Selector, relay and resume in sequence: the scripted drag has already been delivered (or
/// discarded) by the time injection returns.
async fn select_region(
    controller: &RecognitionController,
    relay: &CaptureRelay,
    target: &SurfaceTarget,
    mut relay_rx: mpsc::Receiver<RelayEnvelope>,
    mut resume_rx: mpsc::Receiver<ResumeRequest>,
) -> Result<Option<RecognitionResult>, AppError> {
    controller.begin_region_selection(target).await?;
    let Ok(envelope) = relay_rx.try_recv() else {
        info!("Selection cancelled");
        return Ok(None);
    };
    relay.handle(envelope).await?;
    match resume_rx.try_recv() {
        Ok(request) if request.check_pending => Ok(controller.resume_pending().await?),
        _ => Ok(None),
    }
}

async fn run_resume(settings: &Settings) -> Result<Option<RecognitionResult>, AppError> {
    let controller = build_controller(
        settings,
        Arc::new(Detached),
        Arc::new(Detached),
        handoff_store()?,
    );
    let pipeline = {
        let controller = Arc::clone(&controller);
        async move { controller.resume_pending().await.map_err(AppError::from) }
    };
    drive(controller, pipeline).await
}

async fn execute(command: Command, settings: Settings) -> Result<Option<RecognitionResult>, AppError> {
    match command {
        Command::Full { image } => run_full(&settings, image).await,
        Command::Select {
            image,
            from,
            to,
            device_pixel_ratio,
        } => run_select(&settings, image, from, to, device_pixel_ratio).await,
        Command::Resume => run_resume(&settings).await,
        Command::InitConfig => {
            let path = config::save_settings(&settings)?;
            println!("{}", path.display());
            Ok(None)
        }
    }
}

/// Runs `command` and returns the process exit code.
pub fn run(command: Command) -> i32 {
    let settings = config::load_settings();
    init_tracing(&settings);
    info!(?command, "tab-ocr starting");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %AppError::Runtime(e), "Startup failed");
            return 1;
        }
    };

    match runtime.block_on(execute(command, settings)) {
        Ok(Some(result)) => {
            if !result.is_empty() {
                println!("{}", result.text);
            }
            0
        }
        Ok(None) => 0,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_full() {
        assert_eq!(
            parse_args(&args(&["full", "shot.png"])),
            Ok(Command::Full {
                image: PathBuf::from("shot.png")
            })
        );
        assert!(parse_args(&args(&["full"])).is_err());
    }

    #[test]
    fn test_parse_select_with_ratio() {
        let command =
            parse_args(&args(&["select", "a.png", "1", "2", "30.5", "40", "--dpr", "2"])).unwrap();
        assert_eq!(
            command,
            Command::Select {
                image: PathBuf::from("a.png"),
                from: Point::new(1.0, 2.0),
                to: Point::new(30.5, 40.0),
                device_pixel_ratio: 2.0,
            }
        );
    }

    #[test]
    fn test_parse_select_defaults_ratio() {
        match parse_args(&args(&["select", "a.png", "0", "0", "50", "50"])) {
            Ok(Command::Select {
                device_pixel_ratio, ..
            }) => assert_eq!(device_pixel_ratio, 1.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for bad in [
            vec![],
            vec!["select", "a.png", "0", "0", "x", "5"],
            vec!["select", "a.png", "0", "0", "5"],
            vec!["select", "a.png", "0", "0", "5", "5", "--dpr", "0"],
            vec!["select", "a.png", "0", "0", "5", "5", "--zoom", "2"],
            vec!["resume", "now"],
            vec!["scan"],
        ] {
            assert!(parse_args(&args(&bad)).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_args(&args(&["resume"])), Ok(Command::Resume));
        assert_eq!(parse_args(&args(&["init-config"])), Ok(Command::InitConfig));
    }
}
