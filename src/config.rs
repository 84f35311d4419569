//! Persistent configuration handling for tab-ocr.
//!
//! Persists configuration in a JSON file:
//! `~/.config/tab-ocr/config.json`.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use dirs::config_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::handoff::DEFAULT_HANDOFF_TTL;
use crate::raster::ScalePolicy;
use crate::system::EngineResources;

const APP_CONFIG_DIR_NAME: &str = "tab-ocr";
const CONFIG_FILE_NAME: &str = "config.json";

const DEFAULT_LANGUAGE: &str = "eng";
const DEFAULT_TESSERACT_BINARY: &str = "tesseract";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No config directory available on this platform")]
    NoConfigDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ERROR" => Some(Self::Error),
            "WARN" | "WARNING" => Some(Self::Warn),
            "INFO" => Some(Self::Info),
            "DEBUG" => Some(Self::Debug),
            "TRACE" => Some(Self::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    tessdata_dir: Option<String>,
    #[serde(default)]
    tesseract_binary: Option<String>,
    #[serde(default)]
    max_pixels: Option<u64>,
    #[serde(default)]
    max_dimension: Option<u32>,
    #[serde(default)]
    handoff_ttl_secs: Option<u64>,
    #[serde(default)]
    copy_to_clipboard: Option<bool>,
}

/// Effective settings with every default applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub log_level: LogLevel,
    pub engine: EngineResources,
    pub scale_policy: ScalePolicy,
    pub handoff_ttl: Duration,
    pub copy_to_clipboard: bool,
}

impl Default for Settings {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

impl From<RawConfig> for Settings {
    fn from(raw: RawConfig) -> Self {
        let non_empty = |s: Option<String>| s.filter(|s| !s.trim().is_empty());
        let defaults = ScalePolicy::default();
        Self {
            log_level: raw
                .log_level
                .as_deref()
                .and_then(LogLevel::from_str)
                .unwrap_or_default(),
            engine: EngineResources {
                binary: non_empty(raw.tesseract_binary)
                    .unwrap_or_else(|| DEFAULT_TESSERACT_BINARY.to_string()),
                language: non_empty(raw.language).unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
                data_dir: non_empty(raw.tessdata_dir).map(PathBuf::from),
            },
            scale_policy: ScalePolicy {
                max_pixels: raw
                    .max_pixels
                    .filter(|&p| p > 0)
                    .unwrap_or(defaults.max_pixels),
                max_dimension: raw
                    .max_dimension
                    .filter(|&d| d > 0)
                    .unwrap_or(defaults.max_dimension),
            },
            handoff_ttl: raw
                .handoff_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_HANDOFF_TTL),
            copy_to_clipboard: raw.copy_to_clipboard.unwrap_or(true),
        }
    }
}

impl From<&Settings> for RawConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            log_level: Some(settings.log_level.as_str().to_string()),
            language: Some(settings.engine.language.clone()),
            tessdata_dir: settings
                .engine
                .data_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            tesseract_binary: Some(settings.engine.binary.clone()),
            max_pixels: Some(settings.scale_policy.max_pixels),
            max_dimension: Some(settings.scale_policy.max_dimension),
            handoff_ttl_secs: Some(settings.handoff_ttl.as_secs()),
            copy_to_clipboard: Some(settings.copy_to_clipboard),
        }
    }
}

fn config_path() -> Option<PathBuf> {
    let path = config_dir()?
        .join(APP_CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME);
    Some(path)
}

fn load_raw_config() -> Result<RawConfig, ConfigError> {
    let Some(path) = config_path() else {
        debug!("No config_dir available, using defaults only");
        return Ok(RawConfig::default());
    };

    if !path.exists() {
        debug!(?path, "Config file does not exist, using defaults");
        return Ok(RawConfig::default());
    }

    let data = fs::read_to_string(&path)?;
    let cfg = serde_json::from_str(&data)?;
    debug!(?path, "Config loaded");
    Ok(cfg)
}

fn save_raw_config(mut cfg: RawConfig) -> Result<PathBuf, ConfigError> {
    let path = config_path().ok_or(ConfigError::NoConfigDir)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    cfg.log_level = cfg.log_level.filter(|s| !s.is_empty());
    cfg.language = cfg.language.filter(|s| !s.is_empty());
    cfg.tessdata_dir = cfg.tessdata_dir.filter(|s| !s.is_empty());
    cfg.tesseract_binary = cfg.tesseract_binary.filter(|s| !s.is_empty());

    let data = serde_json::to_string_pretty(&cfg)?;
    fs::write(&path, data)?;
    debug!(?path, "Config saved");
    Ok(path)
}

/// Loads settings, falling back to defaults when the file is missing or unreadable.
pub fn load_settings() -> Settings {
    match load_raw_config() {
        Ok(cfg) => cfg.into(),
        Err(err) => {
            warn!(error = ?err, "Failed to load config, using defaults");
            Settings::default()
        }
    }
}

/// Writes `settings` to the config file and returns its path.
pub fn save_settings(settings: &Settings) -> Result<PathBuf, ConfigError> {
    debug!(?settings, "Saving settings");
    save_raw_config(settings.into()).map_err(|err| {
        error!(error = ?err, "Failed to save config");
        err
    })
}
