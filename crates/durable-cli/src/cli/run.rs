//! `start`, `resume` and `crash-after` handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use durable_core::engine::fault::FaultHook;
use durable_core::engine::WorkflowRunner;
use durable_core::repository::step::StepStore;
use durable_types::step::StepStatus;

use crate::onboarding::OnboardingWorkflow;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Start,
    Resume,
}

/// Drive the onboarding workflow under `workflow_id` and report the outcome.
pub async fn run_workflow(
    state: &AppState,
    workflow_id: &str,
    mode: RunMode,
    hook: Arc<dyn FaultHook>,
    json: bool,
) -> Result<()> {
    tracing::info!(
        workflow_id,
        ?mode,
        stale_after_ms = state.config.stale_after_ms,
        "running onboarding workflow"
    );

    let runner = WorkflowRunner::with_hook(Arc::clone(&state.store), hook);
    let workflow = OnboardingWorkflow::default();
    let outcome = match mode {
        RunMode::Start => runner.start(workflow_id, &workflow).await,
        RunMode::Resume => runner.resume(workflow_id, &workflow).await,
    };
    outcome.with_context(|| format!("workflow '{workflow_id}' failed"))?;

    let steps = state.store.list_steps(workflow_id).await?;
    let retried = steps.iter().filter(|s| s.attempt > 1).count();
    let completed = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .count();

    if json {
        let out = serde_json::json!({
            "workflow_id": workflow_id,
            "status": "completed",
            "steps": steps.len(),
            "completed": completed,
            "retried": retried,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' completed ({} steps, {} retried)",
        style("*").green().bold(),
        style(workflow_id).cyan(),
        completed,
        retried
    );
    println!(
        "  {}",
        style(format!("durable steps {workflow_id}")).dim()
    );
    println!();

    Ok(())
}
