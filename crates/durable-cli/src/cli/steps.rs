//! `steps` handler: render the step records of one workflow.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use durable_core::repository::step::StepStore;
use durable_types::step::{StepRecord, StepStatus};

use crate::state::AppState;

pub async fn show_steps(state: &AppState, workflow_id: &str, json: bool) -> Result<()> {
    let steps = state.store.list_steps(workflow_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    if steps.is_empty() {
        println!();
        println!("  No steps recorded for workflow '{workflow_id}'.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "  Steps for workflow '{}'",
        style(workflow_id).cyan()
    );
    println!(
        "  {}",
        style(state.data_dir.display().to_string()).dim()
    );
    println!();
    println!("{}", steps_table(&steps));
    println!();

    Ok(())
}

fn steps_table(steps: &[StepRecord]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Seq").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Status"),
            Cell::new("Attempt"),
            Cell::new("Updated"),
            Cell::new("Error"),
        ]);

    for s in steps {
        table.add_row(vec![
            Cell::new(s.sequence),
            Cell::new(&s.step_id),
            format_status(s.status),
            Cell::new(s.attempt),
            Cell::new(s.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(s.error.as_deref().unwrap_or("-")),
        ]);
    }

    table
}

fn format_status(status: StepStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        StepStatus::Completed => cell.fg(Color::Green),
        StepStatus::InProgress => cell.fg(Color::Yellow),
        StepStatus::Failed => cell.fg(Color::Red),
    }
}
