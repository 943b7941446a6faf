//! `dagrun node ...` commands

use anyhow::{Context, Result};

use crate::runner::Runner;

pub async fn details(runner: &Runner, plan_id: &str, node_ref: &str, as_json: bool) -> Result<()> {
    let (node, state) = runner
        .node_details(plan_id, node_ref)
        .await
        .with_context(|| format!("Unknown node {node_ref} in plan {plan_id}"))?;

    if as_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({"node": node, "state": state}))?
        );
        return Ok(());
    }

    println!("Node {} ({})", node.producer_id, node.name);
    println!("  task: {}", node.task);
    println!("  status: {}  attempts: {}", state.status, state.attempts);
    if let Some(error) = &state.error {
        println!("  error: {error}");
    }
    if let Some(commit) = &state.completed_commit {
        println!("  commit: {commit}");
    }
    if let Some(summary) = &state.work_summary {
        println!(
            "  changes: +{} ~{} -{} ({} commits)",
            summary.files_added, summary.files_modified, summary.files_deleted, summary.commit_count
        );
    }
    if let Some(steps) = &state.step_statuses {
        for (phase, status) in steps {
            println!("  {phase}: {status:?}");
        }
    }
    Ok(())
}

pub async fn logs(runner: &Runner, plan_id: &str, node_ref: &str, tail: Option<usize>) -> Result<()> {
    let entries = runner
        .node_logs(plan_id, node_ref, tail)
        .await
        .with_context(|| format!("Unknown node {node_ref} in plan {plan_id}"))?;

    for entry in entries {
        println!(
            "{} [{}] {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.phase,
            entry.message
        );
    }
    Ok(())
}

pub async fn retry(runner: &Runner, plan_id: &str, node_ref: &str) -> Result<()> {
    runner.retry_node(plan_id, node_ref).await?;
    println!("Reset node {node_ref} for retry");
    Ok(())
}

pub async fn import_spec(
    runner: &Runner,
    plan_id: &str,
    node_ref: &str,
    phase: &str,
    file: &std::path::Path,
) -> Result<()> {
    runner.import_node_spec(plan_id, node_ref, phase, file).await?;
    println!("Imported {phase} spec for node {node_ref} from {}", file.display());
    Ok(())
}
