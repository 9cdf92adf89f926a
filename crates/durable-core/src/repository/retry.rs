//! Busy-retry policy for store operations.
//!
//! SQLite allows one writer at a time; a second writer sees a transient
//! "database is locked" signal. Stores absorb that signal by re-running the
//! whole operation a bounded number of times with a fixed pause in between.
//! Any other error is returned immediately.

use std::future::Future;
use std::time::Duration;

use durable_types::config::EngineConfig;
use durable_types::error::StoreError;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default pause between retries.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(200);

/// Stateless busy-retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Fixed pause before each retry.
    pub backoff: Duration,
}

impl Default for BusyRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl BusyRetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.busy_max_retries,
            backoff: config.busy_backoff(),
        }
    }

    /// Whether another attempt should follow `error`.
    ///
    /// `retries` counts retries already performed (0 after the first failure).
    pub fn should_retry(&self, retries: u32, error: &StoreError) -> bool {
        error.is_busy() && retries < self.max_retries
    }

    /// Sleep before retry number `retry` (1-based).
    pub async fn pause(&self, retry: u32, error: &StoreError) {
        tracing::warn!(
            retry,
            max_retries = self.max_retries,
            backoff_ms = self.backoff.as_millis() as u64,
            error = %error,
            "store busy, retrying"
        );
        tokio::time::sleep(self.backoff).await;
    }

    /// Translate the final error once retrying has stopped.
    ///
    /// A busy error that survived every retry becomes `RetriesExhausted`;
    /// anything else passes through untouched.
    pub fn give_up(&self, error: StoreError, retries: u32) -> StoreError {
        match error {
            StoreError::Busy(message) => StoreError::RetriesExhausted {
                attempts: retries + 1,
                message,
            },
            other => other,
        }
    }

    /// Run `op` until it succeeds, fails fatally, or retries run out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if self.should_retry(retries, &error) => {
                    retries += 1;
                    self.pause(retries, &error).await;
                }
                Err(error) => return Err(self.give_up(error, retries)),
            }
        }
    }
}
