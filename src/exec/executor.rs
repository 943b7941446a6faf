//! Phase-sequence executor for one node
//!
//! Drives setup, forward integration, prechecks, work, commit, and
//! postchecks in a given worktree, reporting per-phase sub-statuses and a
//! result record. The executor never touches plan state; the runner applies
//! the result through the state machine.

use std::collections::BTreeMap;

use crate::domain::{LogEntry, OnFailure, Phase, StepStatus, WorkSpec, WorkSummary};

use super::context::ExecutionContext;
use super::process::SpecOutcome;
use super::{agent, process};

/// The result of executing a node's phases
#[derive(Debug, Clone, Default)]
pub struct JobExecutionResult {
    pub success: bool,
    pub error: Option<String>,
    pub completed_commit: Option<String>,
    pub work_summary: Option<WorkSummary>,
    pub aggregated_work_summary: Option<WorkSummary>,
    pub step_statuses: BTreeMap<Phase, StepStatus>,
    pub agent_session_id: Option<String>,
    pub failed_phase: Option<Phase>,
    pub exit_code: Option<i32>,
    /// Mirrored from the failing spec's onFailure config
    pub no_auto_heal: bool,
    pub failure_message: Option<String>,
    pub override_resume_from_phase: Option<Phase>,
    pub canceled: bool,
    pub timed_out: bool,
}

/// The phases the executor drives, in order
const PHASES: [Phase; 6] = [
    Phase::Setup,
    Phase::MergeFi,
    Phase::Prechecks,
    Phase::Work,
    Phase::Commit,
    Phase::Postchecks,
];

/// Execute one node in its worktree
pub async fn execute(ctx: &ExecutionContext) -> JobExecutionResult {
    let mut result = JobExecutionResult::default();
    for phase in PHASES {
        result.step_statuses.insert(phase, StepStatus::Pending);
    }

    for phase in PHASES {
        // Heal resume: everything before the resume phase keeps its standing.
        if let Some(resume) = ctx.resume_from_phase
            && phase < resume
        {
            result.step_statuses.insert(phase, StepStatus::Skipped);
            continue;
        }

        if ctx.cancel.is_canceled() {
            return canceled_at(result, phase);
        }

        result.step_statuses.insert(phase, StepStatus::Running);
        let outcome = run_phase(ctx, phase, &mut result).await;

        match outcome {
            PhaseOutcome::Success => {
                result.step_statuses.insert(phase, StepStatus::Success);
            }
            PhaseOutcome::Skipped => {
                result.step_statuses.insert(phase, StepStatus::Skipped);
            }
            PhaseOutcome::Failed(spec_result) => {
                result.step_statuses.insert(phase, StepStatus::Failed);
                result.success = false;
                result.failed_phase = Some(phase);
                result.error = spec_result.error.clone();
                result.exit_code = spec_result.exit_code;
                result.canceled = spec_result.canceled;
                result.timed_out = spec_result.timed_out;
                if let Some(session) = spec_result.agent_session_id {
                    result.agent_session_id = Some(session);
                }
                mirror_on_failure(&mut result, failing_spec(ctx, phase));
                return result;
            }
        }
    }

    result.success = true;
    populate_summaries(ctx, &mut result);
    result
}

enum PhaseOutcome {
    Success,
    Skipped,
    Failed(SpecOutcome),
}

async fn run_phase(
    ctx: &ExecutionContext,
    phase: Phase,
    result: &mut JobExecutionResult,
) -> PhaseOutcome {
    match phase {
        Phase::Setup => run_setup(ctx),
        Phase::MergeFi => run_merge_fi(ctx),
        Phase::Prechecks => run_spec_phase(ctx, phase, ctx.node.prechecks.as_ref(), result).await,
        Phase::Work => run_spec_phase(ctx, phase, ctx.node.work.as_ref(), result).await,
        Phase::Commit => run_commit(ctx, result),
        Phase::Postchecks => run_spec_phase(ctx, phase, ctx.node.postchecks.as_ref(), result).await,
        // merge-ri and cleanup belong to the runner.
        Phase::MergeRi | Phase::Cleanup => PhaseOutcome::Success,
    }
}

/// The worktree is created by the runner before execution; setup verifies it
/// is usable.
fn run_setup(ctx: &ExecutionContext) -> PhaseOutcome {
    if !ctx.worktree_path.is_dir() {
        return PhaseOutcome::Failed(SpecOutcome::failed(format!(
            "Worktree missing at {}",
            ctx.worktree_path.display()
        )));
    }
    ctx.log.append(LogEntry::info(
        Phase::Setup,
        format!(
            "Worktree at {} (base {})",
            ctx.worktree_path.display(),
            &ctx.base_commit[..ctx.base_commit.len().min(12)]
        ),
    ));
    PhaseOutcome::Success
}

/// Merge each dependency's output commit, ascending by node id
fn run_merge_fi(ctx: &ExecutionContext) -> PhaseOutcome {
    if ctx.dependencies.is_empty() {
        return PhaseOutcome::Skipped;
    }

    for dep in &ctx.dependencies {
        ctx.log.append(LogEntry::info(
            Phase::MergeFi,
            format!(
                "Merging {} from dependency {}",
                &dep.commit[..dep.commit.len().min(12)],
                dep.node_id
            ),
        ));
        if let Err(e) =
            ctx.git
                .merge_commit_into_worktree(&ctx.worktree_path, &dep.commit, ctx.merge_strategy)
        {
            let message = format!("{e:#}");
            ctx.log.append(LogEntry::error(Phase::MergeFi, message.clone()));
            return PhaseOutcome::Failed(SpecOutcome::failed(message));
        }
    }
    PhaseOutcome::Success
}

async fn run_spec_phase(
    ctx: &ExecutionContext,
    phase: Phase,
    spec: Option<&WorkSpec>,
    result: &mut JobExecutionResult,
) -> PhaseOutcome {
    let Some(spec) = spec else {
        return PhaseOutcome::Skipped;
    };

    let outcome = match spec {
        WorkSpec::Agent { .. } => agent::run_agent_spec(ctx, phase, spec).await,
        _ => process::run_command_spec(ctx, phase, spec).await,
    };

    if let Some(session) = &outcome.agent_session_id {
        result.agent_session_id = Some(session.clone());
    }

    if outcome.success {
        PhaseOutcome::Success
    } else {
        PhaseOutcome::Failed(outcome)
    }
}

/// Stage and commit the work. A clean copy skips the phase; under
/// `expects_no_changes` a dirty copy fails it instead.
fn run_commit(ctx: &ExecutionContext, result: &mut JobExecutionResult) -> PhaseOutcome {
    let clean = match ctx.git.is_clean(&ctx.worktree_path) {
        Ok(clean) => clean,
        Err(e) => return PhaseOutcome::Failed(SpecOutcome::failed(format!("{e:#}"))),
    };

    if ctx.node.expects_no_changes {
        return if clean {
            PhaseOutcome::Skipped
        } else {
            PhaseOutcome::Failed(SpecOutcome::failed(format!(
                "Node \"{}\" expected no changes but the working copy is dirty",
                ctx.node.producer_id
            )))
        };
    }

    if clean {
        // Nothing to commit; dependents will see no output from this node.
        return PhaseOutcome::Skipped;
    }

    let message = commit_message(&ctx.node.producer_id, &ctx.node.task);
    match ctx.git.commit_all(&ctx.worktree_path, &message) {
        Ok(Some(sha)) => {
            ctx.log
                .append(LogEntry::info(Phase::Commit, format!("Committed {}", &sha[..12])));
            result.completed_commit = Some(sha);
            PhaseOutcome::Success
        }
        Ok(None) => PhaseOutcome::Skipped,
        Err(e) => PhaseOutcome::Failed(SpecOutcome::failed(format!("{e:#}"))),
    }
}

fn populate_summaries(ctx: &ExecutionContext, result: &mut JobExecutionResult) {
    result.work_summary = Some(
        ctx.git
            .work_summary_or_zero(&ctx.worktree_path, &ctx.base_commit),
    );

    // Leaves additionally report the cumulative diff vs the base branch;
    // a git failure leaves the field unset rather than failing the node.
    if ctx.is_leaf && result.completed_commit.is_some() {
        match ctx.git.work_summary(&ctx.worktree_path, &ctx.base_branch) {
            Ok(summary) => result.aggregated_work_summary = Some(summary),
            Err(e) => tracing::warn!("Aggregated work summary failed: {e:#}"),
        }
    }
}

fn canceled_at(mut result: JobExecutionResult, phase: Phase) -> JobExecutionResult {
    result.success = false;
    result.canceled = true;
    result.failed_phase = Some(phase);
    result.error = Some("canceled".to_string());
    result.step_statuses.insert(phase, StepStatus::Failed);
    result
}

fn failing_spec(ctx: &ExecutionContext, phase: Phase) -> Option<&OnFailure> {
    let spec = match phase {
        Phase::Prechecks => ctx.node.prechecks.as_ref(),
        Phase::Work => ctx.node.work.as_ref(),
        Phase::Postchecks => ctx.node.postchecks.as_ref(),
        _ => None,
    };
    spec.and_then(|s| s.on_failure())
}

fn mirror_on_failure(result: &mut JobExecutionResult, on_failure: Option<&OnFailure>) {
    if let Some(cfg) = on_failure {
        result.no_auto_heal = cfg.no_auto_heal;
        result.failure_message = cfg.message.clone();
        result.override_resume_from_phase = cfg.resume_from_phase;
    }
}

/// Generated commit message: producer id plus the first line of the task
fn commit_message(producer_id: &str, task: &str) -> String {
    let summary = task.lines().next().unwrap_or("").trim();
    let mut out = if summary.is_empty() {
        format!("{producer_id}: update")
    } else {
        format!("{producer_id}: {summary}")
    };

    const MAX_LEN: usize = 72;
    if out.chars().count() > MAX_LEN {
        out = out.chars().take(MAX_LEN).collect();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_message_is_single_line_and_bounded() {
        let msg = commit_message("build-api", "Add the endpoint\nwith details");
        assert_eq!(msg, "build-api: Add the endpoint");

        let long = "x".repeat(200);
        assert!(commit_message("node", &long).chars().count() <= 72);

        assert_eq!(commit_message("node", "  "), "node: update");
    }
}
