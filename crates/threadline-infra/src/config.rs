//! Configuration loader for Threadline.
//!
//! Reads `threadline.toml` from the working directory, falling back to
//! `config.toml` in the data directory (`~/.threadline/` by default), and
//! deserializes it into [`ThreadlineConfig`]. A missing or malformed file
//! yields defaults.

use std::path::{Path, PathBuf};

use threadline_types::config::ThreadlineConfig;

/// Environment variable overriding `storage.database_url`.
pub const DATABASE_URL_ENV: &str = "THREADLINE_DATABASE_URL";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "THREADLINE_DATA_DIR";

/// Data directory: `$THREADLINE_DATA_DIR`, else `~/.threadline`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|home| home.join(".threadline"))
        .unwrap_or_else(|| PathBuf::from(".threadline"))
}

/// Candidate config files in lookup order.
pub fn config_search_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("threadline.toml"),
        data_dir().join("config.toml"),
    ]
}

/// Load configuration.
///
/// An explicit path is the only candidate when given. Otherwise the first
/// existing file from [`config_search_paths`] is used. The
/// `THREADLINE_DATABASE_URL` environment variable is applied last.
pub async fn load_config(explicit: Option<&Path>) -> ThreadlineConfig {
    let mut config = match explicit {
        Some(path) => load_config_file(path).await,
        None => {
            let mut found = None;
            for path in config_search_paths() {
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    found = Some(path);
                    break;
                }
            }
            match found {
                Some(path) => load_config_file(&path).await,
                None => {
                    tracing::debug!("No config file found, using defaults");
                    ThreadlineConfig::default()
                }
            }
        }
    };

    apply_database_override(&mut config, std::env::var(DATABASE_URL_ENV).ok());
    config
}

/// Load a single config file.
///
/// - If the file does not exist, returns [`ThreadlineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
pub async fn load_config_file(path: &Path) -> ThreadlineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return ThreadlineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return ThreadlineConfig::default();
        }
    };

    match toml::from_str::<ThreadlineConfig>(&content) {
        Ok(config) => {
            tracing::debug!(path = %path.display(), "config loaded");
            config
        }
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            ThreadlineConfig::default()
        }
    }
}

fn apply_database_override(config: &mut ThreadlineConfig, url: Option<String>) {
    if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
        config.storage.database_url = Some(url);
    }
}
