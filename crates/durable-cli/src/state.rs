//! Application state: data directory, effective configuration and the store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use durable_infra::config::{ensure_data_dir, load_engine_config, resolve_data_dir};
use durable_infra::sqlite::pool::{DatabasePool, database_url};
use durable_infra::sqlite::step::SqliteStepStore;
use durable_types::config::EngineConfig;

/// Everything a command handler needs.
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub store: Arc<SqliteStepStore>,
}

impl AppState {
    /// Resolve the data directory, load `durable.toml`, apply CLI overrides
    /// and open the step database.
    pub async fn init(data_dir: Option<PathBuf>, stale_after_ms: Option<u64>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        ensure_data_dir(&data_dir).await?;

        let mut config = load_engine_config(&data_dir).await;
        if let Some(ms) = stale_after_ms {
            config.stale_after_ms = ms;
        }

        let url = database_url(&data_dir);
        let pool = DatabasePool::new(&url, &config)
            .await
            .with_context(|| format!("failed to open step database at {url}"))?;

        tracing::debug!(
            data_dir = %data_dir.display(),
            stale_after_ms = config.stale_after_ms,
            busy_max_retries = config.busy_max_retries,
            "step store ready"
        );

        Ok(Self {
            store: Arc::new(SqliteStepStore::new(pool, &config)),
            data_dir,
            config,
        })
    }
}
