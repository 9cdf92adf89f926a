//! In-memory step store.
//!
//! Mirrors the SQLite store's semantics: one writer at a time, all-or-nothing
//! transactions, and the same busy-retry loop. Contention can be simulated
//! with [`InMemoryStepStore::inject_busy`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use durable_types::config::EngineConfig;
use durable_types::error::StoreError;
use durable_types::step::StepRecord;
use futures_util::future::BoxFuture;
use tokio::sync::Mutex;

use super::retry::BusyRetryPolicy;
use super::step::{StepStore, StepTransaction, stale_message};

type Records = BTreeMap<(String, String), StepRecord>;

/// Step store backed by a map guarded by a single async mutex.
pub struct InMemoryStepStore {
    records: Mutex<Records>,
    stale_after: Duration,
    retry: BusyRetryPolicy,
    busy_injections: AtomicU32,
}

impl InMemoryStepStore {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            stale_after: config.stale_after(),
            retry: BusyRetryPolicy::from_config(config),
            busy_injections: AtomicU32::new(0),
        }
    }

    /// Make the next `times` transaction attempts fail with `StoreError::Busy`.
    pub fn inject_busy(&self, times: u32) {
        self.busy_injections.store(times, Ordering::SeqCst);
    }

    fn take_injected_busy(&self) -> bool {
        self.busy_injections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn attempt<T, F>(&self, work: &mut F) -> Result<T, StoreError>
    where
        F: for<'t> FnMut(&'t mut InMemoryTransaction) -> BoxFuture<'t, Result<T, StoreError>>,
    {
        if self.take_injected_busy() {
            return Err(StoreError::Busy("database is locked (injected)".to_string()));
        }

        let mut guard = self.records.lock().await;
        let mut tx = InMemoryTransaction {
            records: guard.clone(),
            stale_after: self.stale_after,
        };
        let value = work(&mut tx).await?;
        *guard = tx.records;
        Ok(value)
    }
}

impl Default for InMemoryStepStore {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

/// A private copy of the store's records; written back only on commit.
pub struct InMemoryTransaction {
    records: Records,
    stale_after: Duration,
}

fn key_of(workflow_id: &str, step_key: &str) -> (String, String) {
    (workflow_id.to_string(), step_key.to_string())
}

fn sorted_by_sequence(records: &Records, workflow_id: &str) -> Vec<StepRecord> {
    let mut steps: Vec<StepRecord> = records
        .values()
        .filter(|r| r.workflow_id == workflow_id)
        .cloned()
        .collect();
    steps.sort_by_key(|r| r.sequence);
    steps
}

impl StepTransaction for InMemoryTransaction {
    async fn find(
        &mut self,
        workflow_id: &str,
        step_key: &str,
    ) -> Result<Option<StepRecord>, StoreError> {
        Ok(self.records.get(&key_of(workflow_id, step_key)).cloned())
    }

    async fn insert_in_progress(&mut self, record: &StepRecord) -> Result<(), StoreError> {
        let key = key_of(&record.workflow_id, &record.step_key);
        if self.records.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "step '{}' already exists",
                record.step_key
            )));
        }
        self.records.insert(key, record.clone());
        Ok(())
    }

    async fn update_status(&mut self, record: &StepRecord) -> Result<(), StoreError> {
        match self
            .records
            .get_mut(&key_of(&record.workflow_id, &record.step_key))
        {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(record.step_key.clone())),
        }
    }

    async fn mark_failed_if_stale(&mut self, record: &StepRecord) -> Result<bool, StoreError> {
        let stale_after = self.stale_after;
        let Some(stored) = self
            .records
            .get_mut(&key_of(&record.workflow_id, &record.step_key))
        else {
            return Ok(false);
        };
        if !stored.is_stale_at(Utc::now(), stale_after) {
            return Ok(false);
        }
        *stored = stored.failed(stale_message(stale_after));
        Ok(true)
    }

    async fn list_steps(&mut self, workflow_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        Ok(sorted_by_sequence(&self.records, workflow_id))
    }
}

impl StepStore for InMemoryStepStore {
    type Tx = InMemoryTransaction;

    async fn with_transaction<T, F>(&self, mut work: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Self::Tx) -> BoxFuture<'t, Result<T, StoreError>> + Send,
    {
        let mut retries = 0;
        loop {
            match self.attempt(&mut work).await {
                Ok(value) => return Ok(value),
                Err(e) if self.retry.should_retry(retries, &e) => {
                    retries += 1;
                    self.retry.pause(retries, &e).await;
                }
                Err(e) => return Err(self.retry.give_up(e, retries)),
            }
        }
    }

    async fn find(
        &self,
        workflow_id: &str,
        step_key: &str,
    ) -> Result<Option<StepRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.get(&key_of(workflow_id, step_key)).cloned())
    }

    async fn list_steps(&self, workflow_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(sorted_by_sequence(&records, workflow_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durable_types::step::StepStatus;

    fn test_config() -> EngineConfig {
        EngineConfig {
            stale_after_ms: 50,
            busy_backoff_ms: 1,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = InMemoryStepStore::new(&test_config());
        let record = StepRecord::in_progress("wf", 0, "first");
        store.insert_in_progress(&record).await.unwrap();

        let found = store.find("wf", "wf:0").await.unwrap().unwrap();
        assert_eq!(found, record);
        assert!(store.find("wf", "wf:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_conflict() {
        let store = InMemoryStepStore::default();
        let record = StepRecord::in_progress("wf", 0, "first");
        store.insert_in_progress(&record).await.unwrap();

        let err = store.insert_in_progress(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = InMemoryStepStore::default();
        let record = StepRecord::in_progress("wf", 0, "first").completed("1".to_string());
        let err = store.update_status(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    async fn insert_then_fail(
        tx: &mut InMemoryTransaction,
        record: StepRecord,
    ) -> Result<(), StoreError> {
        tx.insert_in_progress(&record).await?;
        Err(StoreError::Query("boom".to_string()))
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back() {
        let store = InMemoryStepStore::default();
        let record = StepRecord::in_progress("wf", 0, "first");

        let result: Result<(), _> = store
            .with_transaction(move |tx| Box::pin(insert_then_fail(tx, record.clone())))
            .await;

        assert!(result.is_err());
        assert!(store.list_steps("wf").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_busy_is_retried_transparently() {
        let store = InMemoryStepStore::new(&test_config());
        store.inject_busy(3);

        let record = StepRecord::in_progress("wf", 0, "first");
        store.insert_in_progress(&record).await.unwrap();
        assert!(store.find("wf", "wf:0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_busy_exhaustion_surfaces() {
        let store = InMemoryStepStore::new(&test_config());
        store.inject_busy(100);

        let record = StepRecord::in_progress("wf", 0, "first");
        let err = store.insert_in_progress(&record).await.unwrap_err();
        match err {
            StoreError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 6),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert!(store.find("wf", "wf:0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_failed_if_stale() {
        let store = InMemoryStepStore::new(&test_config());
        let mut record = StepRecord::in_progress("wf", 0, "first");
        store.insert_in_progress(&record).await.unwrap();

        assert!(!store.mark_failed_if_stale(&record).await.unwrap(), "fresh claim");

        record.updated_at = Utc::now() - chrono::Duration::seconds(1);
        store.update_status(&record).await.unwrap();
        assert!(store.mark_failed_if_stale(&record).await.unwrap());

        let stored = store.find("wf", "wf:0").await.unwrap().unwrap();
        assert_eq!(stored.status, StepStatus::Failed);
        assert!(stored.error.as_deref().unwrap().contains("abandoned"));

        assert!(!store.mark_failed_if_stale(&stored).await.unwrap(), "already failed");
    }

    #[tokio::test]
    async fn test_recover_stale_only_touches_old_claims() {
        let store = InMemoryStepStore::new(&test_config());

        let mut old = StepRecord::in_progress("wf", 0, "old");
        old.updated_at = Utc::now() - chrono::Duration::seconds(5);
        let fresh = StepRecord::in_progress("wf", 1, "fresh");
        let done = StepRecord::in_progress("wf", 2, "done").completed("0".to_string());
        let other = {
            let mut r = StepRecord::in_progress("other", 0, "old");
            r.updated_at = Utc::now() - chrono::Duration::seconds(5);
            r
        };
        for r in [&old, &fresh, &done, &other] {
            store.insert_in_progress(r).await.unwrap();
        }

        let recovered = store.recover_stale("wf").await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].step_key, "wf:0");

        let steps = store.list_steps("wf").await.unwrap();
        let statuses: Vec<_> = steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Failed, StepStatus::InProgress, StepStatus::Completed]
        );
        assert_eq!(
            store.find("other", "other:0").await.unwrap().unwrap().status,
            StepStatus::InProgress
        );
    }
}
