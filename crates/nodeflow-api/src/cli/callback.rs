//! Manual delivery of a callback result.

use anyhow::{Context, Result};
use console::style;

use nodeflow_types::callback::{ResolveOutcome, ResultPayload};

use crate::state::AppState;

pub async fn resolve(state: &AppState, callback_id: &str, payload: &str, json: bool) -> Result<()> {
    let payload: ResultPayload = serde_json::from_str(payload)
        .context("payload must be a result object, e.g. {\"type\":\"success\",\"outcome\":{}}")?;

    let outcome = state
        .engine
        .protocol()
        .notify(callback_id, payload)
        .await
        .with_context(|| format!("failed to resolve callback '{callback_id}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    let message = match &outcome {
        ResolveOutcome::Transitioned { status } => format!("node moved to {}", style(status).cyan()),
        ResolveOutcome::AwaitingSiblings { remaining } => {
            format!("recorded; waiting on {remaining} more callback(s)")
        }
        ResolveOutcome::Progress => "progress recorded".to_string(),
        ResolveOutcome::Duplicate => format!("{}", style("already resolved, ignored").dim()),
        ResolveOutcome::Stale => format!("{}", style("node already left its waiting state").yellow()),
    };
    println!();
    println!("  {} {}: {message}", style("*").green().bold(), style(callback_id).cyan());
    println!();
    Ok(())
}
