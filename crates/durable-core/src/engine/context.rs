use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::executor::{StepError, StepExecutor};
use super::sequence::SequenceTracker;
use crate::repository::step::StepStore;

/// Handle a workflow body uses to run durable steps.
///
/// Cheap to clone; clones share one sequence counter, so a clone moved into a
/// forked branch keeps numbering consistent with the parent.
pub struct DurableContext<S: StepStore> {
    executor: Arc<StepExecutor<S>>,
    sequence: Arc<SequenceTracker>,
}

impl<S: StepStore> Clone for DurableContext<S> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            sequence: Arc::clone(&self.sequence),
        }
    }
}

impl<S: StepStore + 'static> DurableContext<S> {
    pub fn new(executor: StepExecutor<S>) -> Self {
        Self {
            executor: Arc::new(executor),
            sequence: Arc::new(SequenceTracker::new()),
        }
    }

    pub fn workflow_id(&self) -> &str {
        self.executor.workflow_id()
    }

    /// Run (or replay) the next step in sequence order.
    ///
    /// The sequence number is taken when `step` is called, not when the
    /// returned future is first polled.
    pub fn step<T, E, F, Fut>(
        &self,
        step_id: &str,
        work: F,
    ) -> impl Future<Output = Result<T, StepError>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<anyhow::Error>,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let sequence = self.sequence.reserve();
        self.step_with_sequence(sequence, step_id, work)
    }

    /// Take a sequence number now for a step that will run later, typically
    /// in a forked branch.
    pub fn reserve_sequence(&self) -> u64 {
        self.sequence.reserve()
    }

    /// Run (or replay) a step under a sequence from [`reserve_sequence`].
    ///
    /// [`reserve_sequence`]: Self::reserve_sequence
    pub async fn step_with_sequence<T, E, F, Fut>(
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
        self.executor.execute(sequence, step_id, work).await
    }

    /// Wait until every step cancelled under this context is recorded as
    /// `FAILED`. Call after the workflow body returns.
    pub async fn settle(&self) {
        self.executor.settle().await;
    }
}
