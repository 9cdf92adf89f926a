use std::future::Future;
use std::sync::Arc;

use super::context::DurableContext;
use super::executor::{StepError, StepExecutor};
use super::fault::{FaultHook, NoFaults};
use crate::repository::step::StepStore;

/// A durable workflow body.
///
/// Side effects belong inside `ctx.step` calls, and steps and sequence
/// reservations must be issued in the same order on every run with the same
/// inputs; resume relies on it.
pub trait Workflow: Send + Sync {
    fn run<S: StepStore + 'static>(
        &self,
        ctx: DurableContext<S>,
    ) -> impl Future<Output = Result<(), StepError>> + Send;
}

/// Opens a context for a workflow id and drives a workflow through it.
pub struct WorkflowRunner<S: StepStore> {
    store: Arc<S>,
    hook: Arc<dyn FaultHook>,
}

impl<S: StepStore + 'static> WorkflowRunner<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_hook(store, Arc::new(NoFaults))
    }

    pub fn with_hook(store: Arc<S>, hook: Arc<dyn FaultHook>) -> Self {
        Self { store, hook }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run `workflow` under `workflow_id` for the first time.
    pub async fn start<W: Workflow>(&self, workflow_id: &str, workflow: &W) -> Result<(), StepError> {
        tracing::info!(workflow_id, "starting workflow");
        self.run(workflow_id, workflow).await
    }

    /// Run `workflow` again under an existing `workflow_id`, replaying every
    /// step that already completed.
    pub async fn resume<W: Workflow>(&self, workflow_id: &str, workflow: &W) -> Result<(), StepError> {
        tracing::info!(workflow_id, "resuming workflow");
        self.run(workflow_id, workflow).await
    }

    async fn run<W: Workflow>(&self, workflow_id: &str, workflow: &W) -> Result<(), StepError> {
        let recovered = self.store.recover_stale(workflow_id).await?;
        for record in &recovered {
            tracing::warn!(
                workflow_id,
                step_key = %record.step_key,
                step_id = %record.step_id,
                attempt = record.attempt,
                "recovered stale in-progress step"
            );
        }

        let executor = StepExecutor::new(Arc::clone(&self.store), workflow_id, Arc::clone(&self.hook));
        let ctx = DurableContext::new(executor);
        let outcome = workflow.run(ctx.clone()).await;
        ctx.settle().await;
        outcome?;

        tracing::info!(workflow_id, "workflow completed");
        Ok(())
    }
}
