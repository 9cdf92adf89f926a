//! Demo workflow: onboard a new employee.
//!
//! `create-record`, then `provision-laptop` and `provision-access` in
//! parallel on pre-reserved sequences, then `welcome-email`. Every body
//! sleeps briefly so a crash can land while other steps are in flight.

use std::time::Duration;

use durable_core::engine::{DurableContext, StepError, TaskGroup, Workflow};
use durable_core::repository::step::StepStore;
use uuid::Uuid;

/// The onboarding workflow.
#[derive(Debug, Clone)]
pub struct OnboardingWorkflow {
    step_delay: Duration,
}

impl Default for OnboardingWorkflow {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(200),
        }
    }
}

async fn simulate(step_id: &str, delay: Duration, result: String) -> anyhow::Result<String> {
    tracing::info!(step_id, "executing step");
    tokio::time::sleep(delay).await;
    Ok(result)
}

impl Workflow for OnboardingWorkflow {
    async fn run<S: StepStore + 'static>(&self, ctx: DurableContext<S>) -> Result<(), StepError> {
        let delay = self.step_delay;

        // The id is generated inside the step so a resume replays the same one.
        let employee: String = ctx
            .step("create-record", move || async move {
                simulate("create-record", delay, Uuid::now_v7().to_string()).await
            })
            .await?;

        let laptop_seq = ctx.reserve_sequence();
        let access_seq = ctx.reserve_sequence();
        let mut group = TaskGroup::new();
        for (sequence, step_id, item) in [
            (laptop_seq, "provision-laptop", "laptop"),
            (access_seq, "provision-access", "access"),
        ] {
            let ctx = ctx.clone();
            let result = format!("{item} provisioned for {employee}");
            group.spawn(async move {
                ctx.step_with_sequence(sequence, step_id, move || async move {
                    simulate(step_id, delay, result).await
                })
                .await
            });
        }
        let provisioned = group.join().await?;
        tracing::info!(employee = %employee, items = ?provisioned, "provisioning done");

        let summary: String = ctx
            .step("welcome-email", move || async move {
                simulate("welcome-email", delay, format!("welcome email sent to {employee}")).await
            })
            .await?;
        tracing::info!(workflow_id = ctx.workflow_id(), %summary, "onboarding finished");

        Ok(())
    }
}
