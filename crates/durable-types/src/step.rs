//! Step records: the unit of durable state.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a step record.
///
/// Transitions only ever go `IN_PROGRESS -> COMPLETED` or
/// `IN_PROGRESS -> FAILED`; a `FAILED` record may be claimed again, which
/// moves it back to `IN_PROGRESS` under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    /// The exact string persisted in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::InProgress => "IN_PROGRESS",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(StepStatus::InProgress),
            "COMPLETED" => Ok(StepStatus::Completed),
            "FAILED" => Ok(StepStatus::Failed),
            other => Err(format!("unknown step status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// StepRecord
// ---------------------------------------------------------------------------

/// Build the storage key for a step: `{workflow_id}:{sequence}`.
pub fn step_key(workflow_id: &str, sequence: u64) -> String {
    format!("{workflow_id}:{sequence}")
}

/// Persisted state of one step within one workflow run.
///
/// Identity is `(workflow_id, step_key)`; `step_id` is a label for humans and
/// plays no part in lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub workflow_id: String,
    pub step_key: String,
    pub step_id: String,
    pub sequence: u64,
    pub status: StepStatus,
    /// Encoded result, present only when `Completed`.
    pub output: Option<String>,
    /// Message of the last failure, present only when `Failed`.
    pub error: Option<String>,
    /// 1-based attempt counter; bumped each time a failed step is re-claimed.
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    /// A fresh `IN_PROGRESS` record for the first attempt at `sequence`.
    pub fn in_progress(workflow_id: &str, sequence: u64, step_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            step_key: step_key(workflow_id, sequence),
            step_id: step_id.to_string(),
            sequence,
            status: StepStatus::InProgress,
            output: None,
            error: None,
            attempt: 1,
            updated_at: Utc::now(),
        }
    }

    /// The record moved back to `IN_PROGRESS` for another attempt.
    ///
    /// The label is refreshed from the caller so the row reflects the code
    /// that is actually running now.
    pub fn retried(&self, step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::InProgress,
            output: None,
            error: None,
            attempt: self.attempt + 1,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// The record transitioned to `COMPLETED` with its encoded output.
    pub fn completed(&self, output: String) -> Self {
        Self {
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// The record transitioned to `FAILED`.
    pub fn failed(&self, error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Whether this record is an abandoned `IN_PROGRESS` claim at `now`.
    ///
    /// A record whose age equals `stale_after` exactly is not stale yet.
    pub fn is_stale_at(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if self.status != StepStatus::InProgress {
            return false;
        }
        let Ok(threshold) = chrono::Duration::from_std(stale_after) else {
            return false;
        };
        now.signed_duration_since(self.updated_at) > threshold
    }
}
