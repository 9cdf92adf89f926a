//! Step store trait definitions.
//!
//! Defines the storage interface for step records. Every mutation goes
//! through [`StepStore::with_transaction`], which hands the caller a
//! [`StepTransaction`] on the single writer and retries the whole unit of
//! work when the database reports contention.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use std::future::Future;
use std::time::Duration;

use durable_types::error::StoreError;
use durable_types::step::{StepRecord, StepStatus};
use futures_util::future::BoxFuture;

/// Operations available inside one open store transaction.
///
/// Nothing written through a transaction is visible to other connections
/// until [`StepStore::with_transaction`] commits it.
pub trait StepTransaction: Send {
    /// Point lookup. `None` means the step has never been attempted.
    fn find(
        &mut self,
        workflow_id: &str,
        step_key: &str,
    ) -> impl Future<Output = Result<Option<StepRecord>, StoreError>> + Send;

    /// Insert a new record. A duplicate key fails with `StoreError::Conflict`.
    fn insert_in_progress(
        &mut self,
        record: &StepRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Overwrite status, output, error, attempt and timestamp of an existing
    /// record. Fails with `StoreError::NotFound` if no row matched.
    fn update_status(
        &mut self,
        record: &StepRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Flip an `IN_PROGRESS` record older than the store's stale threshold to
    /// `FAILED`. Returns `true` if the record was flipped.
    fn mark_failed_if_stale(
        &mut self,
        record: &StepRecord,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// All records of a workflow, ordered by sequence.
    fn list_steps(
        &mut self,
        workflow_id: &str,
    ) -> impl Future<Output = Result<Vec<StepRecord>, StoreError>> + Send;
}

/// Repository trait for durable step records.
///
/// Implementations own the busy-retry policy: callers never see
/// `StoreError::Busy`, only success, `RetriesExhausted`, or a fatal error.
pub trait StepStore: Send + Sync {
    type Tx: StepTransaction + 'static;

    /// Run `work` inside one transaction with exclusive write access.
    ///
    /// `Ok` commits, `Err` rolls back. If beginning, running or committing
    /// the transaction hits a busy/locked database, the whole operation
    /// (including `work`) is run again, so `work` must only touch the store.
    fn with_transaction<T, F>(
        &self,
        work: F,
    ) -> impl Future<Output = Result<T, StoreError>> + Send
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Self::Tx) -> BoxFuture<'t, Result<T, StoreError>> + Send;

    /// Point lookup outside any transaction.
    fn find(
        &self,
        workflow_id: &str,
        step_key: &str,
    ) -> impl Future<Output = Result<Option<StepRecord>, StoreError>> + Send;

    /// All records of a workflow, ordered by sequence.
    fn list_steps(
        &self,
        workflow_id: &str,
    ) -> impl Future<Output = Result<Vec<StepRecord>, StoreError>> + Send;

    /// Insert a new `IN_PROGRESS` record in its own transaction.
    fn insert_in_progress(
        &self,
        record: &StepRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let record = record.clone();
        async move {
            self.with_transaction(move |tx| Box::pin(insert_in(tx, record.clone())))
                .await
        }
    }

    /// Overwrite the status of an existing record in its own transaction.
    fn update_status(
        &self,
        record: &StepRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let record = record.clone();
        async move {
            self.with_transaction(move |tx| Box::pin(update_in(tx, record.clone())))
                .await
        }
    }

    /// Stale detection in its own transaction.
    fn mark_failed_if_stale(
        &self,
        record: &StepRecord,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let record = record.clone();
        async move {
            self.with_transaction(move |tx| Box::pin(mark_stale_in(tx, record.clone())))
                .await
        }
    }

    /// Apply stale detection to every `IN_PROGRESS` record of a workflow.
    ///
    /// Returns the records that were flipped to `FAILED` (as they were
    /// before the flip).
    fn recover_stale(
        &self,
        workflow_id: &str,
    ) -> impl Future<Output = Result<Vec<StepRecord>, StoreError>> + Send {
        let workflow_id = workflow_id.to_string();
        async move {
            self.with_transaction(move |tx| Box::pin(recover_stale_in(tx, workflow_id.clone())))
                .await
        }
    }
}

/// Error text recorded on a claim flipped to `FAILED` by stale detection.
pub fn stale_message(stale_after: Duration) -> String {
    format!(
        "abandoned: {} for more than {} ms",
        StepStatus::InProgress,
        stale_after.as_millis()
    )
}

async fn insert_in<Tx: StepTransaction>(tx: &mut Tx, record: StepRecord) -> Result<(), StoreError> {
    tx.insert_in_progress(&record).await
}

async fn update_in<Tx: StepTransaction>(tx: &mut Tx, record: StepRecord) -> Result<(), StoreError> {
    tx.update_status(&record).await
}

async fn mark_stale_in<Tx: StepTransaction>(
    tx: &mut Tx,
    record: StepRecord,
) -> Result<bool, StoreError> {
    tx.mark_failed_if_stale(&record).await
}

async fn recover_stale_in<Tx: StepTransaction>(
    tx: &mut Tx,
    workflow_id: String,
) -> Result<Vec<StepRecord>, StoreError> {
    let mut recovered = Vec::new();
    for record in tx.list_steps(&workflow_id).await? {
        if record.status == StepStatus::InProgress && tx.mark_failed_if_stale(&record).await? {
            recovered.push(record);
        }
    }
    Ok(recovered)
}
