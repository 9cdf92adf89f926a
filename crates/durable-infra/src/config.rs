//! Engine configuration loader and data directory layout.
//!
//! Reads `durable.toml` from the data directory (`~/.durable/` by default)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::{Path, PathBuf};

use durable_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "DURABLE_DATA_DIR";

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE: &str = "durable.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to create data directory {}: {source}", .path.display())]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolve the data directory.
///
/// Priority:
/// 1. `DURABLE_DATA_DIR` environment variable
/// 2. `~/.durable`
/// 3. `./.durable`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".durable");
    }

    PathBuf::from(".durable")
}

/// Create the data directory if it does not exist yet.
pub async fn ensure_data_dir(data_dir: &Path) -> Result<(), ConfigError> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .map_err(|source| ConfigError::DataDir {
            path: data_dir.to_path_buf(),
            source,
        })
}

/// Load engine configuration from `{data_dir}/durable.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => parse_engine_config(&config_path, &content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no engine config file, using defaults");
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!(
                path = %config_path.display(),
                error = %err,
                "engine config unreadable, using defaults"
            );
            EngineConfig::default()
        }
    }
}

fn parse_engine_config(path: &Path, content: &str) -> EngineConfig {
    match toml::from_str::<EngineConfig>(content) {
        Ok(config) => {
            tracing::debug!(
                path = %path.display(),
                stale_after_ms = config.stale_after_ms,
                busy_max_retries = config.busy_max_retries,
                busy_backoff_ms = config.busy_backoff_ms,
                "loaded engine config"
            );
            config
        }
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "engine config invalid, using defaults"
            );
            EngineConfig::default()
        }
    }
}
