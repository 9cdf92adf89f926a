//! SQLite step store implementation.
//!
//! Implements `StepStore` and `StepTransaction` from `durable-core`. Every
//! mutation runs in a transaction on the single-connection writer pool; when
//! SQLite reports the database as busy or locked, the whole transaction is
//! rolled back and run again under the store's `BusyRetryPolicy`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use durable_core::repository::retry::BusyRetryPolicy;
use durable_core::repository::step::{StepStore, StepTransaction, stale_message};
use durable_types::config::EngineConfig;
use durable_types::error::StoreError;
use durable_types::step::{StepRecord, StepStatus};
use futures_util::future::BoxFuture;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};

use super::pool::DatabasePool;

/// Primary result codes for `SQLITE_BUSY` and `SQLITE_LOCKED`.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// SQLite-backed implementation of `StepStore`.
pub struct SqliteStepStore {
    pool: DatabasePool,
    stale_after: Duration,
    retry: BusyRetryPolicy,
}

impl SqliteStepStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool, config: &EngineConfig) -> Self {
        Self {
            pool,
            stale_after: config.stale_after(),
            retry: BusyRetryPolicy::from_config(config),
        }
    }

    async fn attempt<T, F>(&self, work: &mut F) -> Result<T, StoreError>
    where
        F: for<'t> FnMut(&'t mut SqliteTransaction) -> BoxFuture<'t, Result<T, StoreError>>,
    {
        let tx = self.pool.writer.begin().await.map_err(classify)?;
        let mut handle = SqliteTransaction {
            tx,
            stale_after: self.stale_after,
        };

        match work(&mut handle).await {
            Ok(value) => {
                handle.tx.commit().await.map_err(classify)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = handle.tx.rollback().await {
                    tracing::debug!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// An open transaction on the writer connection.
pub struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
    stale_after: Duration,
}

/// Whether `e` is a transient busy/locked condition worth retrying.
///
/// Matches primary and extended `SQLITE_BUSY`/`SQLITE_LOCKED` codes, the
/// "database is locked" message, and a timed-out wait for the writer.
pub fn is_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            let by_code = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED));
            let message = db_err.message();
            by_code || message.contains("database is locked") || message.contains("table is locked")
        }
        _ => false,
    }
}

fn classify(e: sqlx::Error) -> StoreError {
    if is_busy(&e) {
        StoreError::Busy(e.to_string())
    } else {
        StoreError::Query(e.to_string())
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn row_to_step(row: &SqliteRow) -> Result<StepRecord, StoreError> {
    let workflow_id: String = row.try_get("workflow_id").map_err(classify)?;
    let step_key: String = row.try_get("step_key").map_err(classify)?;
    let step_id: String = row.try_get("step_id").map_err(classify)?;
    let sequence: i64 = row.try_get("sequence").map_err(classify)?;
    let status_str: String = row.try_get("status").map_err(classify)?;
    let output: Option<String> = row.try_get("output").map_err(classify)?;
    let error: Option<String> = row.try_get("error").map_err(classify)?;
    let attempt: i64 = row.try_get("attempt").map_err(classify)?;
    let updated_at_str: String = row.try_get("updated_at").map_err(classify)?;

    Ok(StepRecord {
        workflow_id,
        step_key,
        step_id,
        sequence: u64::try_from(sequence)
            .map_err(|_| StoreError::Query(format!("invalid sequence: {sequence}")))?,
        status: status_str.parse::<StepStatus>().map_err(StoreError::Query)?,
        output,
        error,
        attempt: u32::try_from(attempt)
            .map_err(|_| StoreError::Query(format!("invalid attempt: {attempt}")))?,
        updated_at: parse_datetime(&updated_at_str)?,
    })
}

fn sequence_param(record: &StepRecord) -> Result<i64, StoreError> {
    i64::try_from(record.sequence)
        .map_err(|_| StoreError::Query(format!("sequence out of range: {}", record.sequence)))
}

async fn fetch_step<'c, E>(
    executor: E,
    workflow_id: &str,
    step_key: &str,
) -> Result<Option<StepRecord>, StoreError>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM steps WHERE workflow_id = ? AND step_key = ?")
        .bind(workflow_id)
        .bind(step_key)
        .fetch_optional(executor)
        .await
        .map_err(classify)?;

    row.as_ref().map(row_to_step).transpose()
}

async fn fetch_steps<'c, E>(executor: E, workflow_id: &str) -> Result<Vec<StepRecord>, StoreError>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM steps WHERE workflow_id = ? ORDER BY sequence ASC")
        .bind(workflow_id)
        .fetch_all(executor)
        .await
        .map_err(classify)?;

    rows.iter().map(row_to_step).collect()
}

impl StepTransaction for SqliteTransaction {
    async fn find(
        &mut self,
        workflow_id: &str,
        step_key: &str,
    ) -> Result<Option<StepRecord>, StoreError> {
        fetch_step(&mut *self.tx, workflow_id, step_key).await
    }

    async fn insert_in_progress(&mut self, record: &StepRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO steps (workflow_id, step_key, step_id, sequence, status, output, error, attempt, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.workflow_id)
        .bind(&record.step_key)
        .bind(&record.step_id)
        .bind(sequence_param(record)?)
        .bind(record.status.as_str())
        .bind(&record.output)
        .bind(&record.error)
        .bind(i64::from(record.attempt))
        .bind(format_datetime(&record.updated_at))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.is_unique_violation() {
                    return StoreError::Conflict(format!(
                        "step '{}' already exists",
                        record.step_key
                    ));
                }
            }
            classify(e)
        })?;

        Ok(())
    }

    async fn update_status(&mut self, record: &StepRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE steps SET step_id = ?, status = ?, output = ?, error = ?, attempt = ?, updated_at = ?
             WHERE workflow_id = ? AND step_key = ?",
        )
        .bind(&record.step_id)
        .bind(record.status.as_str())
        .bind(&record.output)
        .bind(&record.error)
        .bind(i64::from(record.attempt))
        .bind(format_datetime(&record.updated_at))
        .bind(&record.workflow_id)
        .bind(&record.step_key)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.step_key.clone()));
        }

        Ok(())
    }

    async fn mark_failed_if_stale(&mut self, record: &StepRecord) -> Result<bool, StoreError> {
        let Some(stored) = fetch_step(&mut *self.tx, &record.workflow_id, &record.step_key).await?
        else {
            return Ok(false);
        };
        if !stored.is_stale_at(Utc::now(), self.stale_after) {
            return Ok(false);
        }

        let failed = stored.failed(stale_message(self.stale_after));
        let result = sqlx::query(
            "UPDATE steps SET status = ?, output = NULL, error = ?, updated_at = ?
             WHERE workflow_id = ? AND step_key = ? AND status = ?",
        )
        .bind(failed.status.as_str())
        .bind(&failed.error)
        .bind(format_datetime(&failed.updated_at))
        .bind(&failed.workflow_id)
        .bind(&failed.step_key)
        .bind(StepStatus::InProgress.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_steps(&mut self, workflow_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        fetch_steps(&mut *self.tx, workflow_id).await
    }
}

impl StepStore for SqliteStepStore {
    type Tx = SqliteTransaction;

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
        self.retry
            .run(|| fetch_step(&self.pool.reader, workflow_id, step_key))
            .await
    }

    async fn list_steps(&self, workflow_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        self.retry
            .run(|| fetch_steps(&self.pool.reader, workflow_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    fn test_config() -> EngineConfig {
        EngineConfig {
            stale_after_ms: 1_000,
            busy_timeout_ms: 10,
            busy_backoff_ms: 20,
            ..EngineConfig::default()
        }
    }

    async fn test_store(config: &EngineConfig) -> (SqliteStepStore, String) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        let pool = DatabasePool::new(&url, config).await.unwrap();
        (SqliteStepStore::new(pool, config), url)
    }

    /// Hold the database write lock from a separate connection.
    async fn lock_database(url: &str) -> sqlx::pool::PoolConnection<Sqlite> {
        let opts = SqliteConnectOptions::from_str(url).unwrap();
        let blocker = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .unwrap();
        let mut conn = blocker.acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_insert_find_roundtrip() {
        let (store, _) = test_store(&test_config()).await;
        let record = StepRecord::in_progress("wf", 0, "create-record");
        store.insert_in_progress(&record).await.unwrap();

        let found = store.find("wf", "wf:0").await.unwrap().unwrap();
        assert_eq!(found.workflow_id, "wf");
        assert_eq!(found.step_id, "create-record");
        assert_eq!(found.sequence, 0);
        assert_eq!(found.status, StepStatus::InProgress);
        assert_eq!(found.attempt, 1);
        assert_eq!(found.updated_at, record.updated_at);
        assert!(found.output.is_none());

        assert!(store.find("wf", "wf:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_conflict() {
        let (store, _) = test_store(&test_config()).await;
        let record = StepRecord::in_progress("wf", 0, "a");
        store.insert_in_progress(&record).await.unwrap();

        let err = store.insert_in_progress(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_update_status_and_list_in_sequence_order() {
        let (store, _) = test_store(&test_config()).await;
        for seq in [2, 0, 1] {
            store
                .insert_in_progress(&StepRecord::in_progress("wf", seq, &format!("s{seq}")))
                .await
                .unwrap();
        }

        let first = store.find("wf", "wf:0").await.unwrap().unwrap();
        store
            .update_status(&first.completed("{\"type\":\"u8\",\"value\":1}".to_string()))
            .await
            .unwrap();

        let steps = store.list_steps("wf").await.unwrap();
        let seqs: Vec<u64> = steps.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert!(steps[0].output.is_some());
        assert_eq!(steps[1].status, StepStatus::InProgress);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let (store, _) = test_store(&test_config()).await;
        let record = StepRecord::in_progress("wf", 0, "ghost").failed("nope");
        let err = store.update_status(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_failed_if_stale() {
        let (store, _) = test_store(&test_config()).await;

        let fresh = StepRecord::in_progress("wf", 0, "fresh");
        let mut old = StepRecord::in_progress("wf", 1, "old");
        old.updated_at = Utc::now() - chrono::Duration::minutes(1);
        store.insert_in_progress(&fresh).await.unwrap();
        store.insert_in_progress(&old).await.unwrap();

        assert!(!store.mark_failed_if_stale(&fresh).await.unwrap());
        assert!(store.mark_failed_if_stale(&old).await.unwrap());
        assert!(!store.mark_failed_if_stale(&old).await.unwrap(), "already failed");

        let flipped = store.find("wf", "wf:1").await.unwrap().unwrap();
        assert_eq!(flipped.status, StepStatus::Failed);
        assert!(flipped.error.unwrap().contains("abandoned"));
        assert_eq!(
            store.find("wf", "wf:0").await.unwrap().unwrap().status,
            StepStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_recover_stale_across_workflow() {
        let (store, _) = test_store(&test_config()).await;
        let mut old = StepRecord::in_progress("wf", 0, "old");
        old.updated_at = Utc::now() - chrono::Duration::minutes(1);
        store.insert_in_progress(&old).await.unwrap();
        store
            .insert_in_progress(&StepRecord::in_progress("wf", 1, "fresh"))
            .await
            .unwrap();

        let recovered = store.recover_stale("wf").await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].step_id, "old");
    }

    async fn insert_then_fail(
        tx: &mut SqliteTransaction,
        record: StepRecord,
    ) -> Result<(), StoreError> {
        tx.insert_in_progress(&record).await?;
        Err(StoreError::Query("work failed".to_string()))
    }

    #[tokio::test]
    async fn test_error_in_transaction_rolls_back() {
        let (store, _) = test_store(&test_config()).await;
        let record = StepRecord::in_progress("wf", 0, "a");

        let result = store
            .with_transaction(move |tx| Box::pin(insert_then_fail(tx, record.clone())))
            .await;

        assert!(matches!(result, Err(StoreError::Query(_))));
        assert!(store.list_steps("wf").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locked_database_is_retried_until_released() {
        let config = test_config();
        let (store, url) = test_store(&config).await;
        let mut blocker = lock_database(&url).await;

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            sqlx::query("COMMIT").execute(&mut *blocker).await.unwrap();
        });

        let record = StepRecord::in_progress("wf", 0, "contended");
        store.insert_in_progress(&record).await.unwrap();
        release.await.unwrap();

        assert!(store.find("wf", "wf:0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_locked_database_exhausts_retries() {
        let config = EngineConfig {
            busy_timeout_ms: 5,
            busy_backoff_ms: 1,
            ..test_config()
        };
        let (store, url) = test_store(&config).await;
        let mut blocker = lock_database(&url).await;

        let record = StepRecord::in_progress("wf", 0, "contended");
        let err = store.insert_in_progress(&record).await.unwrap_err();
        match err {
            StoreError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 6),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }

        sqlx::query("ROLLBACK").execute(&mut *blocker).await.unwrap();
        assert!(store.find("wf", "wf:0").await.unwrap().is_none());
    }

    #[test]
    fn test_pool_timeout_is_busy() {
        assert!(is_busy(&sqlx::Error::PoolTimedOut));
        assert!(!is_busy(&sqlx::Error::RowNotFound));
        assert!(classify(sqlx::Error::PoolTimedOut).is_busy());
        assert!(matches!(classify(sqlx::Error::RowNotFound), StoreError::Query(_)));
    }
}
