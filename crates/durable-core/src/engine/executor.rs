//! Step executor: the execute-or-replay protocol.
//!
//! Each step goes through two store transactions:
//!
//! 1. **Claim** -- look up the step's record and decide. A missing or
//!    `FAILED` record is claimed as `IN_PROGRESS`; a `COMPLETED` record is
//!    replayed; an `IN_PROGRESS` record is a conflict (after it has been
//!    checked for staleness).
//! 2. **Finish** -- after the work has run outside any transaction, write
//!    `COMPLETED` with the encoded output, or `FAILED` with the error.
//!
//! The fault hook fires between the two, once the claim is durable. If the
//! step's future is dropped after the hook (a sibling branch failed and the
//! group aborted this one), a spawned write marks the step `FAILED` with
//! [`CANCELLED`]; [`StepExecutor::settle`] waits for those writes.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use durable_types::error::{CodecError, StoreError};
use durable_types::step::{StepRecord, StepStatus, step_key};
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use super::codec::ResultCodec;
use super::fault::FaultHook;
use crate::repository::step::{StepStore, StepTransaction};

/// Outcome of the claim transaction.
#[derive(Debug)]
enum Claim {
    /// The caller owns the step and must run its work.
    Started(StepRecord),
    /// The step already completed; its stored output is authoritative.
    Replay(StepRecord),
    /// Another attempt holds the step. `recovered` is true when the holder
    /// was stale and has just been marked `FAILED`.
    Held { recovered: bool },
}

/// Runs steps of one workflow against a step store.
pub struct StepExecutor<S: StepStore> {
    store: Arc<S>,
    workflow_id: String,
    hook: Arc<dyn FaultHook>,
    cancellations: PendingWrites,
}

impl<S: StepStore + 'static> StepExecutor<S> {
    pub fn new(store: Arc<S>, workflow_id: impl Into<String>, hook: Arc<dyn FaultHook>) -> Self {
        Self {
            store,
            workflow_id: workflow_id.into(),
            hook,
            cancellations: Mutex::new(Vec::new()),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Execute or replay the step at `sequence`.
    ///
    /// `work` runs at most once per call, and only when this call claimed the
    /// step. On replay the recorded output is decoded as `T` and returned
    /// without running `work`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        sequence: u64,
        step_id: &str,
        work: F,
    ) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<anyhow::Error>,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let key = step_key(&self.workflow_id, sequence);

        let record = match self.claim(sequence, step_id, &key).await? {
            Claim::Started(record) => record,
            Claim::Replay(record) => {
                tracing::debug!(
                    workflow_id = %self.workflow_id,
                    step_key = %key,
                    step_id,
                    "replaying completed step"
                );
                return decode_output(&record);
            }
            Claim::Held { recovered } => {
                tracing::warn!(
                    workflow_id = %self.workflow_id,
                    step_key = %key,
                    step_id,
                    recovered,
                    "step currently in progress"
                );
                return Err(StepError::Conflict { step_key: key });
            }
        };

        tracing::debug!(
            workflow_id = %self.workflow_id,
            step_key = %key,
            step_id,
            sequence,
            attempt = record.attempt,
            "step claimed"
        );
        self.hook.after_step_started(&record);

        let guard = self.cancel_guard(&record);
        let result = self.run_claimed(&record, step_id, work).await;
        guard.disarm();
        result
    }

    /// Run the claimed step's work and write its terminal status.
    async fn run_claimed<T, E, F, Fut>(
        &self,
        record: &StepRecord,
        step_id: &str,
        work: F,
    ) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<anyhow::Error>,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let key = record.step_key.clone();

        let outcome: Result<T, anyhow::Error> = work().await.map_err(Into::into);
        let value = match outcome {
            Ok(value) => value,
            Err(error) => {
                self.record_failure(record, format!("{error:#}")).await;
                return Err(StepError::Execution {
                    step_key: key,
                    step_id: step_id.to_string(),
                    source: error,
                });
            }
        };

        let output = match ResultCodec::serialize(&value) {
            Ok(output) => output,
            Err(error) => {
                self.record_failure(record, error.to_string()).await;
                return Err(StepError::Codec {
                    step_key: key,
                    source: error,
                });
            }
        };

        if let Err(error) = self.store.update_status(&record.completed(output)).await {
            self.record_failure(record, error.to_string()).await;
            return Err(StepError::Storage(error));
        }
        tracing::debug!(
            workflow_id = %self.workflow_id,
            step_key = %key,
            step_id,
            "step completed"
        );
        Ok(value)
    }

    /// Arm a guard that marks `record` `FAILED` if the step future is dropped
    /// before it finishes, as happens when a sibling branch fails.
    fn cancel_guard(&self, record: &StepRecord) -> CancelGuard<'_> {
        let store = Arc::clone(&self.store);
        let cancelled = record.failed(CANCELLED);
        let write: BoxFuture<'static, ()> = Box::pin(async move {
            match store.update_status(&cancelled).await {
                Ok(()) => tracing::info!(
                    workflow_id = %cancelled.workflow_id,
                    step_key = %cancelled.step_key,
                    "cancelled step marked failed"
                ),
                Err(e) => tracing::error!(
                    workflow_id = %cancelled.workflow_id,
                    step_key = %cancelled.step_key,
                    error = %e,
                    "failed to record step cancellation"
                ),
            }
        });
        CancelGuard {
            write: Some(write),
            pending: &self.cancellations,
        }
    }

    /// Wait for the `FAILED` writes of cancelled steps to land.
    pub async fn settle(&self) {
        loop {
            let pending = std::mem::take(&mut *lock_pending(&self.cancellations));
            if pending.is_empty() {
                return;
            }
            for task in pending {
                if let Err(e) = task.await {
                    tracing::error!(error = %e, "cancellation write did not finish");
                }
            }
        }
    }

    async fn claim(&self, sequence: u64, step_id: &str, key: &str) -> Result<Claim, StepError> {
        let workflow_id = self.workflow_id.clone();
        let step_id = step_id.to_string();
        self.store
            .with_transaction(move |tx| {
                Box::pin(claim_in(tx, workflow_id.clone(), sequence, step_id.clone()))
            })
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => StepError::Conflict {
                    step_key: key.to_string(),
                },
                other => StepError::Storage(other),
            })
    }

    /// Best-effort `FAILED` write; a failure here is logged, not raised.
    async fn record_failure(&self, record: &StepRecord, message: String) {
        if let Err(e) = self.store.update_status(&record.failed(message)).await {
            tracing::error!(
                workflow_id = %record.workflow_id,
                step_key = %record.step_key,
                error = %e,
                "failed to record step failure"
            );
        }
    }
}

async fn claim_in<Tx: StepTransaction>(
    tx: &mut Tx,
    workflow_id: String,
    sequence: u64,
    step_id: String,
) -> Result<Claim, StoreError> {
    let key = step_key(&workflow_id, sequence);
    let Some(existing) = tx.find(&workflow_id, &key).await? else {
        let record = StepRecord::in_progress(&workflow_id, sequence, &step_id);
        tx.insert_in_progress(&record).await?;
        return Ok(Claim::Started(record));
    };

    match existing.status {
        StepStatus::Completed => Ok(Claim::Replay(existing)),
        StepStatus::InProgress => {
            let recovered = tx.mark_failed_if_stale(&existing).await?;
            Ok(Claim::Held { recovered })
        }
        StepStatus::Failed => {
            let record = existing.retried(&step_id);
            tx.update_status(&record).await?;
            Ok(Claim::Started(record))
        }
    }
}

/// Error message written for a step whose future was dropped mid-flight.
pub const CANCELLED: &str = "cancelled";

type PendingWrites = Mutex<Vec<JoinHandle<()>>>;

fn lock_pending(pending: &PendingWrites) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawns the pending `FAILED` write when dropped while still armed.
struct CancelGuard<'a> {
    write: Option<BoxFuture<'static, ()>>,
    pending: &'a PendingWrites,
}

impl CancelGuard<'_> {
    fn disarm(mut self) {
        self.write = None;
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        let Some(write) = self.write.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => lock_pending(self.pending).push(runtime.spawn(write)),
            Err(_) => tracing::warn!("no runtime to record step cancellation; step stays in progress"),
        }
    }
}

fn decode_output<T: DeserializeOwned + 'static>(record: &StepRecord) -> Result<T, StepError> {
    let codec_error = |source| StepError::Codec {
        step_key: record.step_key.clone(),
        source,
    };
    let output = record
        .output
        .as_deref()
        .ok_or_else(|| codec_error(CodecError::Malformed("completed step has no output".into())))?;
    ResultCodec::deserialize(output).map_err(codec_error)
}

/// Errors surfaced to a workflow body.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("step currently in progress: {step_key}")]
    Conflict { step_key: String },

    #[error("step {step_key} output codec error: {source}")]
    Codec {
        step_key: String,
        #[source]
        source: CodecError,
    },

    #[error("step {step_key} ({step_id}) failed: {source:#}")]
    Execution {
        step_key: String,
        step_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task join error: {0}")]
    TaskJoin(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fault::NoFaults;
    use crate::repository::memory::InMemoryStepStore;
    use chrono::Utc;
    use durable_types::config::EngineConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn store() -> Arc<InMemoryStepStore> {
        Arc::new(InMemoryStepStore::new(&EngineConfig {
            stale_after_ms: 100,
            busy_backoff_ms: 1,
            ..EngineConfig::default()
        }))
    }

    fn executor(store: &Arc<InMemoryStepStore>) -> StepExecutor<InMemoryStepStore> {
        StepExecutor::new(Arc::clone(store), "wf", Arc::new(NoFaults))
    }

    #[derive(Default)]
    struct RecordingHook {
        started: Mutex<Vec<StepRecord>>,
    }

    impl FaultHook for RecordingHook {
        fn after_step_started(&self, record: &StepRecord) {
            self.started.lock().unwrap().push(record.clone());
        }
    }

    #[tokio::test]
    async fn test_first_execution_runs_and_records() {
        let store = store();
        let exec = executor(&store);

        let value: String = exec
            .execute(0, "greet", || async { Ok::<_, anyhow::Error>("hi".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "hi");

        let record = store.find("wf", "wf:0").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.step_id, "greet");
        assert_eq!(record.attempt, 1);
        assert_eq!(
            ResultCodec::deserialize::<String>(record.output.as_deref().unwrap()).unwrap(),
            "hi"
        );
    }

    #[tokio::test]
    async fn test_replay_does_not_rerun_work() {
        let store = store();
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let exec = executor(&store);
            let counter = Arc::clone(&counter);
            let value: u32 = exec
                .execute(0, "count", move || async move {
                    Ok::<_, anyhow::Error>(counter.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .await
                .unwrap();
            assert_eq!(value, 1);
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_in_progress_is_conflict() {
        let store = store();
        store
            .insert_in_progress(&StepRecord::in_progress("wf", 0, "busy"))
            .await
            .unwrap();

        let ran = Arc::new(AtomicU32::new(0));
        let ran_inner = Arc::clone(&ran);
        let err = executor(&store)
            .execute(0, "busy", move || async move {
                ran_inner.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Conflict { ref step_key } if step_key == "wf:0"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let record = store.find("wf", "wf:0").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::InProgress);
    }

    #[tokio::test]
    async fn test_stale_in_progress_is_flipped_then_retried() {
        let store = store();
        let mut abandoned = StepRecord::in_progress("wf", 0, "send");
        abandoned.updated_at = Utc::now() - chrono::Duration::seconds(60);
        store.insert_in_progress(&abandoned).await.unwrap();

        let err = executor(&store)
            .execute(0, "send", || async { Ok::<_, anyhow::Error>(1u8) })
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Conflict { .. }));
        let record = store.find("wf", "wf:0").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Failed, "stale flip is committed");

        let value: u8 = executor(&store)
            .execute(0, "send", || async { Ok::<_, anyhow::Error>(1u8) })
            .await
            .unwrap();
        assert_eq!(value, 1);
        let record = store.find("wf", "wf:0").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.attempt, 2);
    }

    #[tokio::test]
    async fn test_work_failure_is_recorded_and_retryable() {
        let store = store();

        let err = executor(&store)
            .execute(0, "charge", || async {
                Err::<u32, _>(anyhow::anyhow!("card declined"))
            })
            .await
            .unwrap_err();
        match &err {
            StepError::Execution {
                step_key, step_id, ..
            } => {
                assert_eq!(step_key, "wf:0");
                assert_eq!(step_id, "charge");
            }
            other => panic!("expected Execution, got {other:?}"),
        }
        assert!(err.to_string().contains("card declined"));

        let record = store.find("wf", "wf:0").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("card declined"));

        let value: u32 = executor(&store)
            .execute(0, "charge", || async { Ok::<_, anyhow::Error>(99) })
            .await
            .unwrap();
        assert_eq!(value, 99);
        let record = store.find("wf", "wf:0").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.attempt, 2);
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn test_replay_with_wrong_type_is_codec_error() {
        let store = store();
        executor(&store)
            .execute(0, "n", || async { Ok::<_, anyhow::Error>(5u32) })
            .await
            .unwrap();

        let err = executor(&store)
            .execute(0, "n", || async { Ok::<_, anyhow::Error>("5".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StepError::Codec {
                source: CodecError::TypeMismatch { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_hook_sees_committed_claim_and_skips_replays() {
        let store = store();
        let hook = Arc::new(RecordingHook::default());
        let exec = StepExecutor::new(Arc::clone(&store), "wf", hook.clone());

        exec.execute(0, "a", || async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();
        exec.execute(0, "a", || async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();

        let started = hook.started.lock().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].status, StepStatus::InProgress);
        assert_eq!(started[0].step_key, "wf:0");
    }

    #[tokio::test]
    async fn test_failed_completion_write_records_failure() {
        let store = store();
        let contended = Arc::clone(&store);

        // Every attempt of the COMPLETED write hits a busy store; the
        // follow-up FAILED write gets through.
        let err = executor(&store)
            .execute(0, "ship", move || async move {
                contended.inject_busy(6);
                Ok::<_, anyhow::Error>(7u32)
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StepError::Storage(StoreError::RetriesExhausted { attempts: 6, .. })
        ));

        let record = store.find("wf", "wf:0").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("busy after 6 attempts"));

        let value: u32 = executor(&store)
            .execute(0, "ship", || async { Ok::<_, anyhow::Error>(7u32) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(store.find("wf", "wf:0").await.unwrap().unwrap().attempt, 2);
    }

    #[tokio::test]
    async fn test_dropped_step_is_marked_cancelled() {
        let store = store();
        let exec = executor(&store);

        let step = exec.execute(0, "slow", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, anyhow::Error>(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(20), step).await.is_err());
        exec.settle().await;

        let record = store.find("wf", "wf:0").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.error.as_deref(), Some(CANCELLED));

        exec.execute(0, "slow", || async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();
        let record = store.find("wf", "wf:0").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.attempt, 2);
    }

    #[tokio::test]
    async fn test_finished_step_leaves_nothing_to_settle() {
        let store = store();
        let exec = executor(&store);
        exec.execute(0, "quick", || async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();
        exec.settle().await;

        let record = store.find("wf", "wf:0").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_busy_store_is_invisible_to_steps() {
        let store = store();
        store.inject_busy(2);

        let value: i64 = executor(&store)
            .execute(0, "x", || async { Ok::<_, anyhow::Error>(-1) })
            .await
            .unwrap();
        assert_eq!(value, -1);
    }
}
