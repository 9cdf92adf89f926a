//! Fork/join over durable branches.
//!
//! Each branch is a tokio task. [`TaskGroup::join`] waits for all of them; on
//! the first failure it aborts the rest and reports that failure. Steps a
//! sibling already committed stay committed and replay on resume; a step
//! aborted mid-flight is marked `FAILED` and runs again on resume.

use std::future::Future;

use tokio::task::JoinSet;

use super::executor::StepError;

/// A set of concurrently running branches with a common result type.
pub struct TaskGroup<T> {
    tasks: JoinSet<(usize, Result<T, StepError>)>,
    spawned: usize,
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            spawned: 0,
        }
    }

    /// Start a branch. It begins running immediately.
    pub fn spawn<F>(&mut self, branch: F)
    where
        F: Future<Output = Result<T, StepError>> + Send + 'static,
    {
        let index = self.spawned;
        self.spawned += 1;
        self.tasks.spawn(async move { (index, branch.await) });
    }

    pub fn len(&self) -> usize {
        self.spawned
    }

    pub fn is_empty(&self) -> bool {
        self.spawned == 0
    }

    /// Wait for every branch. Results come back in spawn order.
    pub async fn join(mut self) -> Result<Vec<T>, StepError> {
        let mut results: Vec<Option<T>> = (0..self.spawned).map(|_| None).collect();

        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok((index, Ok(value))) => {
                    results[index] = Some(value);
                    continue;
                }
                Ok((index, Err(e))) => {
                    tracing::warn!(branch = index, error = %e, "branch failed, cancelling siblings");
                    e
                }
                Err(e) => StepError::TaskJoin(e.to_string()),
            };

            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
            return Err(failure);
        }

        Ok(results.into_iter().flatten().collect())
    }
}
