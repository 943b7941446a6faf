//! `dagrun plan ...` commands

use anyhow::{Context, Result, bail};
use std::path::Path;

use crate::domain::{PlanSpec, PlanStatus};
use crate::plan::PlanStateMachine;
use crate::runner::Runner;

/// Create a plan from a JSON spec file; optionally run it to completion
pub async fn create(runner: &Runner, spec_path: &Path, start: bool) -> Result<()> {
    let raw = std::fs::read_to_string(spec_path)
        .with_context(|| format!("Failed to read {}", spec_path.display()))?;
    let spec: PlanSpec =
        serde_json::from_str(&raw).with_context(|| format!("Invalid spec in {}", spec_path.display()))?;

    let plan_id = runner.create_plan(&spec).await?;
    println!("Created plan {plan_id}");

    if start {
        run(runner, &plan_id).await?;
    }
    Ok(())
}

/// Start a plan and wait for it to finish
pub async fn run(runner: &Runner, plan_id: &str) -> Result<()> {
    runner.start(plan_id).await?;
    println!("Running plan {plan_id}...");
    let status = runner.wait_for_plan(plan_id).await?;
    println!("Plan {plan_id} finished: {status}");
    if !matches!(status, PlanStatus::Succeeded) {
        bail!("Plan ended with status {status}");
    }
    Ok(())
}

pub async fn list(runner: &Runner, status: Option<&str>, as_json: bool) -> Result<()> {
    let filter = match status {
        Some(raw) => Some(
            PlanStatus::parse_filter(raw)
                .with_context(|| format!("Unknown status filter \"{raw}\""))?,
        ),
        None => None,
    };

    let plans = runner.list_plans(filter).await;
    if as_json {
        let rows: Vec<serde_json::Value> = plans
            .iter()
            .map(|(id, name, status, created_at)| {
                serde_json::json!({"id": id, "name": name, "status": status, "created_at": created_at})
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if plans.is_empty() {
        println!("No plans");
        return Ok(());
    }
    for (id, name, status, created_at) in plans {
        println!("{id}  {status:<9}  {}  {name}", created_at.format("%Y-%m-%d %H:%M"));
    }
    Ok(())
}

pub async fn status(runner: &Runner, plan_id: &str, as_json: bool) -> Result<()> {
    let plan = runner
        .get_plan(plan_id)
        .await
        .with_context(|| format!("Unknown plan {plan_id}"))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let machine = PlanStateMachine::new(plan);
    let plan = machine.plan();
    println!("Plan {} ({})", plan.id, plan.spec.name);
    println!("  status: {}", machine.compute_plan_status());
    println!("  base: {}  target: {}", plan.base_branch, plan.target_branch);

    let mut nodes: Vec<_> = plan.nodes.values().collect();
    nodes.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
    for node in nodes {
        let state = &plan.node_states[&node.id];
        let commit = state
            .completed_commit
            .as_deref()
            .map(|c| &c[..c.len().min(12)])
            .unwrap_or("-");
        println!(
            "  {:<28} {:<9} attempts={} commit={}",
            node.producer_id, state.status, state.attempts, commit
        );
    }
    Ok(())
}

pub async fn pause(runner: &Runner, plan_id: &str) -> Result<()> {
    runner.pause(plan_id).await?;
    println!("Paused plan {plan_id}");
    Ok(())
}

pub async fn resume(runner: &Runner, plan_id: &str) -> Result<()> {
    runner.resume(plan_id).await?;
    println!("Resumed plan {plan_id}");
    Ok(())
}

pub async fn cancel(runner: &Runner, plan_id: &str) -> Result<()> {
    runner.cancel(plan_id).await?;
    println!("Canceled plan {plan_id}");
    Ok(())
}

pub async fn delete(runner: &Runner, plan_id: &str) -> Result<()> {
    runner.delete_plan(plan_id).await?;
    println!("Deleted plan {plan_id}");
    Ok(())
}

pub async fn retry(runner: &Runner, plan_id: &str) -> Result<()> {
    runner.retry_plan(plan_id).await?;
    println!("Retrying plan {plan_id}...");
    let status = runner.wait_for_plan(plan_id).await?;
    println!("Plan {plan_id} finished: {status}");
    Ok(())
}
