//! Drives a single scheduled node: worktree preparation, execution with
//! auto-heal, result application, consumption bookkeeping, and the final
//! reverse integration for the terminal validation node.

use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::domain::{
    AttemptRecord, FailureReason, JobNode, NodeId, NodeStatus, Phase, WorkSpec,
};
use crate::exec::{self, DependencyCommit, ExecutionContext, JobExecutionResult, LogSink};
use crate::git::{GitManager, derive_branch_name};
use crate::plan::TransitionFields;
use crate::store::log_key;

use super::{PlanHandle, RunnerInner, consume};

/// Immutable facts gathered under the machine lock before execution
struct NodeLaunch {
    node: JobNode,
    attempt: u32,
    /// Branch the node bases on (node override, else the plan's)
    base_branch: String,
    plan_base_branch: String,
    plan_name: String,
    target_branch: String,
    worktree_path: PathBuf,
    worktree_root: PathBuf,
    dep_commits: Vec<DependencyCommit>,
    is_leaf: bool,
    is_snapshot_validation: bool,
    plan_auto_heal: bool,
    resume_session: Option<String>,
}

pub(super) async fn drive_node(
    inner: Arc<RunnerInner>,
    handle: Arc<PlanHandle>,
    node_id: NodeId,
) {
    drive(&inner, &handle, &node_id).await;
    inner.global_running.fetch_sub(1, Ordering::SeqCst);
    inner.wake_all();
}

async fn drive(inner: &Arc<RunnerInner>, handle: &Arc<PlanHandle>, node_id: &NodeId) {
    let Some(git) = handle.git.clone() else {
        fail_before_start(inner, handle, node_id, "Repository is not accessible").await;
        return;
    };

    let launch = match snapshot_launch(handle, node_id).await {
        Some(launch) => launch,
        None => return,
    };

    // Base commit: single dependency -> its output; multiple -> the first in
    // deterministic order (FI pulls in the rest); none -> the branch tip.
    let base_commit = match launch.dep_commits.first() {
        Some(dep) => dep.commit.clone(),
        None => match git.rev_parse(&launch.base_branch) {
            Ok(sha) => sha,
            Err(e) => {
                fail_before_start(inner, handle, node_id, format!("{e:#}")).await;
                return;
            }
        },
    };

    // A stale worktree from a prior attempt is replaced.
    if launch.worktree_path.exists()
        && let Err(e) = git.remove_worktree(&launch.worktree_path)
    {
        tracing::warn!("Failed to clear stale worktree: {e:#}");
    }
    if let Err(e) = git.create_detached_worktree(&launch.worktree_path, &base_commit) {
        fail_before_start(inner, handle, node_id, format!("{e:#}")).await;
        return;
    }

    {
        let mut machine = handle.machine.lock().await;
        machine.transition(
            node_id,
            NodeStatus::Running,
            TransitionFields {
                base_commit: Some(base_commit.clone()),
                worktree_path: Some(launch.worktree_path.clone()),
                ..Default::default()
            },
        );
        inner.persist(&machine);
    }

    // The work process pid lands in node state as soon as it spawns, so a
    // crashed host can tell dead runs from live ones.
    let (pid_tx, mut pid_rx) = tokio::sync::mpsc::unbounded_channel();
    {
        let inner = inner.clone();
        let handle = handle.clone();
        let node_id = node_id.clone();
        tokio::spawn(async move {
            while let Some(pid) = pid_rx.recv().await {
                let mut machine = handle.machine.lock().await;
                if let Some(state) = machine.plan_mut().node_states.get_mut(&node_id) {
                    state.pid = Some(pid);
                    state.version += 1;
                }
                machine.plan_mut().touch();
                inner.persist(&machine);
            }
        });
    }

    let log_store = inner.logs.clone();
    let key = log_key(&handle.id, node_id, launch.attempt);
    let log = LogSink::new(move |entry| {
        if let Err(e) = log_store.append(&key, &entry) {
            tracing::warn!("Log write failed: {e:#}");
        }
    });

    let mut ctx = ExecutionContext {
        plan_id: handle.id.clone(),
        node: launch.node.clone(),
        base_commit,
        base_branch: launch.plan_base_branch.clone(),
        worktree_path: launch.worktree_path.clone(),
        dependencies: launch.dep_commits.clone(),
        is_leaf: launch.is_leaf,
        merge_strategy: inner.config.settings.merge_strategy,
        cancel: handle.cancel_signal(),
        resume_session_id: launch.resume_session.clone(),
        resume_from_phase: None,
        agent: inner.config.settings.agent.clone(),
        git: git.clone(),
        log,
        pid_notify: Some(pid_tx),
        kill_grace: std::time::Duration::from_secs(inner.config.settings.kill_grace_secs),
    };

    let mut result = run_with_heal(&mut ctx, &launch).await;

    // The terminal validation leaf performs the final reverse integration
    // before it is allowed to succeed.
    let mut merged_to_target = false;
    if result.success && launch.is_snapshot_validation {
        match final_merge(inner, &git, &launch, &result) {
            Ok(()) => merged_to_target = true,
            Err(e) => {
                result.success = false;
                result.failed_phase = Some(Phase::MergeRi);
                result.error = Some(format!("{e:#}"));
            }
        }
    }

    apply_result(inner, handle, node_id, &launch, &result, merged_to_target).await;

    if result.success {
        finalize_success(inner, handle, &git, node_id, &result).await;
    }
}

async fn snapshot_launch(handle: &Arc<PlanHandle>, node_id: &NodeId) -> Option<NodeLaunch> {
    let machine = handle.machine.lock().await;
    let plan = machine.plan();
    let node = plan.nodes.get(node_id)?.clone();
    let state = plan.node_states.get(node_id)?;

    let mut dep_commits: Vec<DependencyCommit> = node
        .dependencies
        .iter()
        .filter_map(|dep| {
            plan.node_states
                .get(dep)
                .and_then(|s| s.completed_commit.clone())
                .map(|commit| DependencyCommit {
                    node_id: dep.clone(),
                    commit,
                })
        })
        .collect();
    dep_commits.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    let resume_session = state
        .agent_session_id
        .clone()
        .or_else(|| state.last_attempt.as_ref()?.agent_session_id.clone());

    Some(NodeLaunch {
        attempt: state.attempts + 1,
        base_branch: node
            .base_branch
            .clone()
            .unwrap_or_else(|| plan.base_branch.clone()),
        plan_base_branch: plan.base_branch.clone(),
        plan_name: plan.spec.name.clone(),
        target_branch: plan.target_branch.clone(),
        worktree_path: node.worktree_path_under(&plan.worktree_root),
        worktree_root: plan.worktree_root.clone(),
        is_leaf: plan.leaves.contains(node_id),
        is_snapshot_validation: plan.snapshot_validation_node_id() == Some(node_id),
        plan_auto_heal: plan.spec.auto_heal.unwrap_or(false),
        resume_session,
        dep_commits,
        node,
    })
}

/// Execute the node, healing failed phases at most once each when auto-heal
/// applies, and resuming from the configured phase.
async fn run_with_heal(ctx: &mut ExecutionContext, launch: &NodeLaunch) -> JobExecutionResult {
    let mut healed: HashSet<Phase> = HashSet::new();
    let mut carry: Option<JobExecutionResult> = None;

    loop {
        let mut result = exec::execute(ctx).await;

        // Phases before the resume point were not re-run; their prior
        // outcomes (and any commit they produced) stand.
        if let (Some(prev), Some(resume)) = (carry.as_ref(), ctx.resume_from_phase) {
            for (phase, status) in &prev.step_statuses {
                if *phase < resume {
                    result.step_statuses.insert(*phase, *status);
                }
            }
            if result.completed_commit.is_none() && resume > Phase::Commit {
                result.completed_commit = prev.completed_commit.clone();
            }
        }

        if let Some(session) = &result.agent_session_id {
            ctx.resume_session_id = Some(session.clone());
        }
        if result.success || result.canceled || result.timed_out {
            return result;
        }
        let Some(phase) = result.failed_phase else {
            return result;
        };

        let heal_enabled =
            (launch.plan_auto_heal || launch.node.auto_heal) && !result.no_auto_heal;
        if !heal_enabled || !healed.insert(phase) {
            return result;
        }

        tracing::info!(
            "Auto-heal for node {} after {} failure",
            launch.node.producer_id,
            phase
        );
        let heal_spec = build_heal_spec(&launch.node, phase, result.error.as_deref());

        // The corrective agent runs fresh, not as a resumed session.
        let saved_session = ctx.resume_session_id.take();
        let heal = exec::run_work_spec(ctx, phase, &heal_spec).await;
        ctx.resume_session_id = saved_session;

        if !heal.success {
            tracing::warn!(
                "Auto-heal failed for node {}: {}",
                launch.node.producer_id,
                heal.error.as_deref().unwrap_or("unknown")
            );
            return result;
        }

        ctx.resume_from_phase = Some(
            result
                .override_resume_from_phase
                .unwrap_or(phase),
        );
        carry = Some(result);
    }
}

/// Corrective agent spec: inherits the failing spec's access lists and
/// always includes the worktree (added by the agent runner).
fn build_heal_spec(node: &JobNode, phase: Phase, error: Option<&str>) -> WorkSpec {
    let source = match phase {
        Phase::Prechecks => node.prechecks.as_ref(),
        Phase::Postchecks => node.postchecks.as_ref(),
        _ => node.work.as_ref(),
    };
    let (folders, urls) = match source {
        Some(WorkSpec::Agent {
            allowed_folders,
            allowed_urls,
            ..
        }) => (allowed_folders.clone(), allowed_urls.clone()),
        _ => (None, None),
    };

    let mut spec = WorkSpec::agent(format!(
        "The {} phase of the task \"{}\" failed:\n{}\n\n\
        Diagnose the failure and fix its cause in this working tree so the \
        phase succeeds when it runs again.",
        phase,
        node.task.lines().next().unwrap_or(&node.task),
        error.unwrap_or("(no error output)")
    ));
    if let WorkSpec::Agent {
        allowed_folders,
        allowed_urls,
        ..
    } = &mut spec
    {
        *allowed_folders = folders;
        *allowed_urls = urls;
    }
    spec
}

/// A failure before the node ever ran (worktree or rev-parse trouble)
async fn fail_before_start(
    inner: &Arc<RunnerInner>,
    handle: &Arc<PlanHandle>,
    node_id: &NodeId,
    error: impl Into<String>,
) {
    let error = error.into();
    tracing::error!("Node {node_id} failed during preparation: {error}");
    let mut machine = handle.machine.lock().await;
    machine.transition(
        node_id,
        NodeStatus::Failed,
        TransitionFields {
            error: Some(error),
            failure_reason: Some(FailureReason::Error),
            ..Default::default()
        },
    );
    inner.persist(&machine);
}

async fn apply_result(
    inner: &Arc<RunnerInner>,
    handle: &Arc<PlanHandle>,
    node_id: &NodeId,
    launch: &NodeLaunch,
    result: &JobExecutionResult,
    merged_to_target: bool,
) {
    let mut machine = handle.machine.lock().await;

    let status = if result.canceled {
        NodeStatus::Canceled
    } else if result.success {
        NodeStatus::Succeeded
    } else {
        NodeStatus::Failed
    };

    let attempt_record = AttemptRecord {
        attempt: launch.attempt,
        started_at: machine.get_node_state(node_id).and_then(|s| s.started_at),
        ended_at: Some(Utc::now()),
        status,
        failed_phase: result.failed_phase,
        error: result.error.clone(),
        exit_code: result.exit_code,
        agent_session_id: result.agent_session_id.clone(),
        step_statuses: Some(result.step_statuses.clone()),
    };

    let failure_reason = if result.canceled {
        Some(FailureReason::Abort)
    } else if result.timed_out {
        Some(FailureReason::Timeout)
    } else if !result.success {
        Some(FailureReason::Error)
    } else {
        None
    };

    // User-visible failure text prefers the spec's configured message.
    let error = if result.success {
        None
    } else {
        result
            .failure_message
            .clone()
            .or_else(|| result.error.clone())
    };

    let fields = TransitionFields {
        error,
        completed_commit: result.completed_commit.clone(),
        work_summary: result.work_summary.clone(),
        aggregated_work_summary: result.aggregated_work_summary.clone(),
        merged_to_target: merged_to_target.then_some(true),
        agent_session_id: result.agent_session_id.clone(),
        last_attempt: Some(attempt_record.clone()),
        failure_reason,
        step_statuses: Some(result.step_statuses.clone()),
        ..Default::default()
    };

    if !machine.transition(node_id, status, fields) {
        // Cancellation can beat us to a terminal state; keep the attempt
        // record anyway.
        if let Some(state) = machine.plan_mut().node_states.get_mut(node_id) {
            state.attempt_history.push(attempt_record.clone());
            state.last_attempt = Some(attempt_record);
            state.version += 1;
        }
        machine.plan_mut().touch();
    }
    if let Some(state) = machine.plan_mut().node_states.get_mut(node_id) {
        state.pid = None;
    }

    inner.persist(&machine);
}

/// Consumption acknowledgment, reverse integration into waiting worktrees,
/// and worktree reclamation after a success.
async fn finalize_success(
    inner: &Arc<RunnerInner>,
    handle: &Arc<PlanHandle>,
    git: &GitManager,
    node_id: &NodeId,
    result: &JobExecutionResult,
) {
    // Acknowledge each dependency we forward-integrated.
    let ri_targets: Vec<PathBuf> = {
        let mut machine = handle.machine.lock().await;
        let node = match machine.plan().nodes.get(node_id) {
            Some(node) => node.clone(),
            None => return,
        };
        for dep in &node.dependencies {
            consume::acknowledge_consumption(machine.plan_mut(), dep, &node.id);
        }
        inner.persist(&machine);

        // Dependents whose worktrees already exist but have not started yet
        // receive this node's output now; running ones pick it up via FI.
        match &result.completed_commit {
            None => Vec::new(),
            Some(_) => node
                .dependents
                .iter()
                .filter_map(|dep| {
                    let state = machine.plan().node_states.get(dep)?;
                    if state.status == NodeStatus::Scheduled {
                        state.worktree_path.clone()
                    } else {
                        None
                    }
                })
                .collect(),
        }
    };

    if let Some(commit) = &result.completed_commit {
        for worktree in ri_targets {
            if let Err(e) = git.merge_commit_into_worktree(
                &worktree,
                commit,
                inner.config.settings.merge_strategy,
            ) {
                tracing::warn!("Reverse integration into {} failed: {e:#}", worktree.display());
            }
        }
    }

    cleanup_pass(inner, handle, git).await;
}

/// Final reverse integration: merge the validated snapshot into the target
/// branch.
fn final_merge(
    inner: &Arc<RunnerInner>,
    git: &GitManager,
    launch: &NodeLaunch,
    result: &JobExecutionResult,
) -> anyhow::Result<()> {
    let branch = resolve_target_branch(inner, git, &launch.target_branch, &launch.plan_name);

    let base_tip = git.rev_parse(&launch.plan_base_branch)?;
    git.ensure_branch(&branch, &base_tip)?;

    // The validation node may produce no commit of its own; the snapshot is
    // then its worktree HEAD (base plus the integrated dependencies).
    let commit = match &result.completed_commit {
        Some(commit) => commit.clone(),
        None => git.worktree_head(&launch.worktree_path)?,
    };

    let merged = git.merge_commit_into_branch(
        &branch,
        &commit,
        inner.config.settings.merge_strategy,
        &launch.worktree_root,
    )?;
    tracing::info!("Merged plan snapshot into {branch} at {merged}");
    Ok(())
}

/// The effective target branch. The repository's default branch is never
/// merged into directly; a derived feature branch substitutes for it.
fn resolve_target_branch(
    inner: &Arc<RunnerInner>,
    git: &GitManager,
    target_branch: &str,
    plan_name: &str,
) -> String {
    let target = target_branch.trim();
    let default = git.default_branch().unwrap_or_else(|_| "main".to_string());
    if target.is_empty() || target == default {
        derive_branch_name(&inner.config.settings.branch_prefix, plan_name)
    } else {
        target.to_string()
    }
}

/// Reclaim every worktree whose output all consumers have taken
pub(super) async fn cleanup_pass(
    inner: &Arc<RunnerInner>,
    handle: &Arc<PlanHandle>,
    git: &GitManager,
) {
    let candidates: Vec<(NodeId, PathBuf)> = {
        let machine = handle.machine.lock().await;
        let plan = machine.plan();
        plan.nodes
            .keys()
            .filter(|id| consume::cleanup_candidate(plan, id))
            .filter_map(|id| {
                plan.node_states[id]
                    .worktree_path
                    .clone()
                    .map(|path| (id.clone(), path))
            })
            .collect()
    };

    if candidates.is_empty() {
        return;
    }

    for (node_id, worktree) in candidates {
        if let Err(e) = git.remove_worktree(&worktree) {
            tracing::warn!("Worktree cleanup failed for {}: {e:#}", worktree.display());
            continue;
        }
        let mut machine = handle.machine.lock().await;
        if let Some(state) = machine.plan_mut().node_states.get_mut(&node_id) {
            state.worktree_cleaned_up = true;
            state.version += 1;
        }
        machine.plan_mut().touch();
        inner.persist(&machine);
    }
}
