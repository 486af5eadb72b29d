//! Run inspection and plan-wide commands.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use nodeflow_types::execution::Status;

use crate::state::AppState;
use crate::view::tree_rows;

fn status_cell(status: Status) -> Cell {
    let cell = Cell::new(status.as_str());
    if status.is_broken() {
        cell.fg(Color::Red)
    } else if status == Status::Succeeded {
        cell.fg(Color::Green)
    } else if status.is_flowing() {
        cell.fg(Color::Yellow)
    } else {
        cell
    }
}

fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

pub async fn show_tree(state: &AppState, plan_id: Uuid, json: bool) -> Result<()> {
    let adjacency = state
        .engine
        .tree()
        .execution_tree(plan_id)
        .await
        .with_context(|| format!("failed to load execution tree of {plan_id}"))?;
    let rows = tree_rows(&adjacency);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!();
        println!("  No records for run {}.", style(plan_id).cyan());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Id"),
            Cell::new("Category"),
            Cell::new("Mode"),
            Cell::new("Status"),
        ]);

    for row in &rows {
        let mut label = format!("{}{}", "  ".repeat(row.depth), row.identifier);
        if row.old_retry {
            label.push_str(" (retried)");
        }
        table.add_row(vec![
            Cell::new(label),
            Cell::new(short_id(&row.node_execution_id)),
            Cell::new(row.step_category.as_str()),
            Cell::new(row.mode.map(|m| m.as_str()).unwrap_or("-")),
            status_cell(row.status),
        ]);
    }

    println!();
    println!("  Execution tree of {}", style(plan_id).cyan());
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

pub async fn show_stages(state: &AppState, plan_id: Uuid, json: bool) -> Result<()> {
    let stages = state
        .engine
        .tree()
        .stage_summary(plan_id)
        .await
        .with_context(|| format!("failed to load stages of {plan_id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stages)?);
        return Ok(());
    }

    if stages.is_empty() {
        println!();
        println!("  Run {} has no stages.", style(plan_id).cyan());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#"),
            Cell::new("Stage").fg(Color::Cyan),
            Cell::new("FQN"),
            Cell::new("Status"),
            Cell::new("Created"),
        ]);

    for (i, stage) in stages.iter().enumerate() {
        let name = if stage.is_strategy {
            format!("{} (strategy)", stage.name)
        } else {
            stage.name.clone()
        };
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(name),
            Cell::new(stage.stage_fqn.as_deref().unwrap_or("-")),
            status_cell(stage.status),
            Cell::new(stage.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Abort / purge
// ---------------------------------------------------------------------------

pub async fn abort(state: &AppState, plan_id: Uuid, issued_by: &str, json: bool) -> Result<()> {
    let summary = state
        .engine
        .abort_plan(plan_id, issued_by)
        .await
        .with_context(|| format!("failed to abort {plan_id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Aborted run {}",
        style("*").green().bold(),
        style(plan_id).cyan()
    );
    println!("  Discontinued: {}", summary.discontinued);
    println!("  Handlers stopped: {}", summary.handlers_aborted);
    println!("  Aborted: {}", summary.aborted);
    println!();
    Ok(())
}

pub async fn purge(state: &AppState, plan_id: Uuid, force: bool, json: bool) -> Result<()> {
    if !force {
        anyhow::bail!("refusing to purge {plan_id} without --force");
    }

    let summary = state
        .engine
        .purge(plan_id)
        .await
        .with_context(|| format!("failed to purge {plan_id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Purged run {}: {} records, {} callback waits",
        style("*").green().bold(),
        style(plan_id).cyan(),
        summary.nodes,
        summary.callbacks
    );
    println!();
    Ok(())
}
