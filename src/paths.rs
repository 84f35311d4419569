//! On-disk locations: `~/.tab-ocr` holds the cache that captures and handoff records live in.

use std::path::PathBuf;

const APP_DIR_NAME: &str = ".tab-ocr";
const CACHE_DIR_NAME: &str = "cache";

/// `~/.tab-ocr`
pub fn app_data_dir() -> Result<PathBuf, String> {
    dirs::home_dir()
        .map(|home| home.join(APP_DIR_NAME))
        .ok_or_else(|| "Could not determine home directory".to_string())
}

/// `~/.tab-ocr/cache`
pub fn cache_dir() -> Result<PathBuf, String> {
    Ok(app_data_dir()?.join(CACHE_DIR_NAME))
}
