//! Engine configuration types.
//!
//! `EngineConfig` represents the optional `durable.toml` in the data
//! directory. Every field has a default, so an empty file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the step store and executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Age after which a dangling `IN_PROGRESS` record may be marked `FAILED`.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,

    /// Retries of a whole store operation on a busy/locked database.
    #[serde(default = "default_busy_max_retries")]
    pub busy_max_retries: u32,

    /// Fixed pause between busy retries.
    #[serde(default = "default_busy_backoff_ms")]
    pub busy_backoff_ms: u64,

    /// Connection-level SQLite busy timeout, the first line of defense.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_stale_after_ms() -> u64 {
    10_000
}

fn default_busy_max_retries() -> u32 {
    5
}

fn default_busy_backoff_ms() -> u64 {
    200
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: default_stale_after_ms(),
            busy_max_retries: default_busy_max_retries(),
            busy_backoff_ms: default_busy_backoff_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl EngineConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn busy_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
