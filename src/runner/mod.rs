//! The runner: owns plan instances in memory, drives execution, and manages
//! persistence and crash recovery
//!
//! One long-lived loop per active plan; multiple plans advance concurrently
//! under a process-wide parallelism cap. All state-machine mutation happens
//! behind a per-plan async mutex.

mod consume;
mod drive;
mod recovery;

pub use consume::{acknowledge_consumption, all_consumers_consumed, cleanup_candidate};
pub use recovery::{pid_alive, recover_plan};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Mutex, Notify};

use crate::config::Config;
use crate::domain::{
    JobNode, NodeExecutionState, NodeId, NodeStatus, PlanEvent, PlanId, PlanInstance, PlanSpec,
    PlanStatus, WorkSpec,
};
use crate::exec::{CancelHandle, CancelSignal};
use crate::git::GitManager;
use crate::plan::{self, BuildOptions, PlanStateMachine, scheduler};
use crate::store::{
    LogStore, PlanStore, import_spec_file, load_node_spec, log_key, save_node_spec,
    save_plan_specs,
};

/// One registered plan and its runtime machinery
pub(crate) struct PlanHandle {
    pub(crate) id: PlanId,
    pub(crate) machine: Mutex<PlanStateMachine>,
    pub(crate) git: Option<GitManager>,
    cancel: StdMutex<CancelHandle>,
    pub(crate) wake: Notify,
    loop_running: AtomicBool,
}

impl PlanHandle {
    pub(crate) fn cancel_signal(&self) -> CancelSignal {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .signal()
    }
}

pub(crate) struct RunnerInner {
    pub(crate) config: Config,
    pub(crate) store: PlanStore,
    pub(crate) logs: LogStore,
    plans: StdMutex<HashMap<PlanId, Arc<PlanHandle>>>,
    pub(crate) global_max_parallel: AtomicUsize,
    pub(crate) global_running: AtomicUsize,
    /// Shared with event-forwarding tasks, which must not keep the whole
    /// runner (and its store lock) alive
    observers: Arc<StdMutex<Vec<UnboundedSender<PlanEvent>>>>,
}

impl RunnerInner {
    /// Persist a snapshot; a failed save is logged and the in-memory state
    /// stands.
    pub(crate) fn persist(&self, machine: &PlanStateMachine) {
        if let Err(e) = self.store.save_plan(machine.plan()) {
            tracing::error!("Failed to persist plan {}: {e:#}", machine.plan().id);
        }
    }

    pub(crate) fn wake_all(&self) {
        let handles: Vec<Arc<PlanHandle>> = {
            let plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
            plans.values().cloned().collect()
        };
        for handle in handles {
            handle.wake.notify_one();
        }
    }

    fn handle(&self, plan_id: &str) -> Option<Arc<PlanHandle>> {
        self.plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(plan_id)
            .cloned()
    }

}

fn broadcast(
    observers: &Arc<StdMutex<Vec<UnboundedSender<PlanEvent>>>>,
    event: PlanEvent,
) {
    let mut observers = observers.lock().unwrap_or_else(|e| e.into_inner());
    observers.retain(|tx| tx.send(event.clone()).is_ok());
}

/// Backfill phase specs stored outside the snapshot (large inputs and the
/// legacy `work.md` form) for nodes whose snapshot carries none.
fn hydrate_specs(store: &PlanStore, plan: &mut PlanInstance) {
    let dir = store.plan_dir(&plan.id);
    for node in plan.nodes.values_mut() {
        if node.work.is_none() {
            node.work = load_node_spec(&dir, &node.producer_id, "work");
        }
        if node.prechecks.is_none() {
            node.prechecks = load_node_spec(&dir, &node.producer_id, "prechecks");
        }
        if node.postchecks.is_none() {
            node.postchecks = load_node_spec(&dir, &node.producer_id, "postchecks");
        }
    }
}

/// Orchestrates every plan in this process
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    pub fn new(config: Config) -> Result<Runner> {
        let storage_root = config.storage_root();
        let store = PlanStore::open(&storage_root)?;
        let logs = LogStore::new(storage_root.join("logs"));
        let global_max = config.settings.global_max_parallel;

        Ok(Runner {
            inner: Arc::new(RunnerInner {
                config,
                store,
                logs,
                plans: StdMutex::new(HashMap::new()),
                global_max_parallel: AtomicUsize::new(global_max.max(1)),
                global_running: AtomicUsize::new(0),
                observers: Arc::new(StdMutex::new(Vec::new())),
            }),
        })
    }

    /// Load persisted plans, run crash recovery on each, and wire events.
    /// Plans become visible to callers only after recovery.
    pub async fn initialize(&self) -> Result<()> {
        let ids: Vec<PlanId> = self.inner.store.list_plans().keys().cloned().collect();
        for plan_id in ids {
            let Some(mut plan) = self.inner.store.load_plan(&plan_id) else {
                tracing::warn!("Skipping unreadable plan {plan_id}");
                continue;
            };
            hydrate_specs(&self.inner.store, &mut plan);
            let mut machine = PlanStateMachine::new(plan);
            let changed = recovery::recover_plan(&mut machine);
            let handle = self.register(machine).await;
            if changed {
                let machine = handle.machine.lock().await;
                self.inner.persist(&machine);
            }
        }
        Ok(())
    }

    /// Register a machine: wire its event stream and index it
    async fn register(&self, mut machine: PlanStateMachine) -> Arc<PlanHandle> {
        let plan_id = machine.plan().id.clone();
        let repo_path = machine.plan().repo_path.clone();

        let (events_tx, mut events_rx) = unbounded_channel();
        machine.set_event_sender(events_tx);
        let observers = self.inner.observers.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                broadcast(&observers, event);
            }
        });

        let git = match GitManager::new(&repo_path) {
            Ok(git) => Some(git),
            Err(e) => {
                tracing::warn!("Plan {plan_id}: {e:#}");
                None
            }
        };

        let (cancel_handle, _) = CancelSignal::new();
        let handle = Arc::new(PlanHandle {
            id: plan_id.clone(),
            machine: Mutex::new(machine),
            git,
            cancel: StdMutex::new(cancel_handle),
            wake: Notify::new(),
            loop_running: AtomicBool::new(false),
        });

        self.inner
            .plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(plan_id, handle.clone());
        handle
    }

    /// Build, persist, and register a new plan
    pub async fn create_plan(&self, spec: &PlanSpec) -> Result<PlanId> {
        let plan = plan::build_plan(
            spec,
            BuildOptions {
                repo_path: Some(self.inner.config.repo_path.clone()),
                ..Default::default()
            },
        )?;
        let plan_id = plan.id.clone();

        self.inner
            .store
            .save_plan(&plan)
            .context("Failed to persist new plan")?;
        if let Err(e) = save_plan_specs(&self.inner.store.plan_dir(&plan_id), &plan) {
            tracing::warn!("Failed to write spec files for {plan_id}: {e:#}");
        }

        self.register(PlanStateMachine::new(plan)).await;
        tracing::info!("Created plan {plan_id} ({})", spec.name);
        Ok(plan_id)
    }

    /// Enter the run loop for a plan
    pub async fn start(&self, plan_id: &str) -> Result<()> {
        let handle = self.require(plan_id)?;
        {
            let mut machine = handle.machine.lock().await;
            if machine.plan().ended_at.is_some() {
                bail!("Plan {plan_id} has already ended");
            }
            if machine.plan().started_at.is_none() {
                machine.plan_mut().started_at = Some(Utc::now());
                machine.plan_mut().touch();
            }
            self.inner.persist(&machine);
        }

        // Re-arm cancellation for a fresh run.
        {
            let mut cancel = handle.cancel.lock().unwrap_or_else(|e| e.into_inner());
            let (fresh, _) = CancelSignal::new();
            *cancel = fresh;
        }

        self.ensure_loop(&handle);
        Ok(())
    }

    fn ensure_loop(&self, handle: &Arc<PlanHandle>) {
        if handle
            .loop_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(run_loop(self.inner.clone(), handle.clone()));
        }
    }

    pub async fn pause(&self, plan_id: &str) -> Result<()> {
        let handle = self.require(plan_id)?;
        let mut machine = handle.machine.lock().await;
        machine.plan_mut().is_paused = true;
        machine.plan_mut().touch();
        self.inner.persist(&machine);
        drop(machine);
        handle.wake.notify_one();
        Ok(())
    }

    pub async fn resume(&self, plan_id: &str) -> Result<()> {
        let handle = self.require(plan_id)?;
        {
            let mut machine = handle.machine.lock().await;
            machine.plan_mut().is_paused = false;
            machine.plan_mut().touch();
            self.inner.persist(&machine);
        }
        self.ensure_loop(&handle);
        handle.wake.notify_one();
        Ok(())
    }

    /// Cancel every non-terminal node and stop the plan
    pub async fn cancel(&self, plan_id: &str) -> Result<()> {
        let handle = self.require(plan_id)?;
        handle
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        let mut machine = handle.machine.lock().await;
        machine.cancel_all();
        self.inner.persist(&machine);
        drop(machine);
        handle.wake.notify_one();
        Ok(())
    }

    /// Reset one node for retry; the loop picks it up when it becomes ready
    pub async fn retry_node(&self, plan_id: &str, node_id: &str) -> Result<()> {
        let handle = self.require(plan_id)?;
        let node_id = self.resolve_node_id(&handle, node_id).await?;
        let started = {
            let mut machine = handle.machine.lock().await;
            if !machine.reset_node_to_pending(&node_id) {
                bail!("Unknown node {node_id}");
            }
            self.inner.persist(&machine);
            machine.plan().started_at.is_some()
        };
        if started {
            self.ensure_loop(&handle);
        }
        handle.wake.notify_one();
        Ok(())
    }

    /// Reset every failed or canceled node and run again
    pub async fn retry_plan(&self, plan_id: &str) -> Result<()> {
        let handle = self.require(plan_id)?;
        {
            let mut machine = handle.machine.lock().await;
            let targets: Vec<NodeId> = machine
                .plan()
                .node_states
                .iter()
                .filter(|(_, s)| {
                    matches!(s.status, NodeStatus::Failed | NodeStatus::Canceled)
                })
                .map(|(id, _)| id.clone())
                .collect();
            if targets.is_empty() {
                bail!("Plan {plan_id} has no failed nodes to retry");
            }
            for node_id in targets {
                machine.reset_node_to_pending(&node_id);
            }
            self.inner.persist(&machine);
        }
        self.start(plan_id).await
    }

    /// Remove a plan, its persisted artifacts, and any remaining worktrees
    pub async fn delete_plan(&self, plan_id: &str) -> Result<()> {
        let handle = self.require(plan_id)?;
        handle
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();

        let (worktrees, worktree_root) = {
            let mut machine = handle.machine.lock().await;
            machine.cancel_all();
            let plan = machine.plan();
            let paths: Vec<std::path::PathBuf> = plan
                .node_states
                .values()
                .filter(|s| !s.worktree_cleaned_up)
                .filter_map(|s| s.worktree_path.clone())
                .collect();
            (paths, plan.worktree_root.clone())
        };

        if let Some(git) = &handle.git {
            for worktree in worktrees {
                if let Err(e) = git.remove_worktree(&worktree) {
                    tracing::warn!("Failed to remove worktree {}: {e:#}", worktree.display());
                }
            }
        }
        if worktree_root.exists() {
            let _ = std::fs::remove_dir_all(&worktree_root);
        }

        self.inner.store.delete_plan(plan_id)?;
        self.inner.logs.delete_plan_logs(plan_id);
        self.inner
            .plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plan_id);
        tracing::info!("Deleted plan {plan_id}");
        Ok(())
    }

    // ----- queries ---------------------------------------------------------

    pub async fn get_plan(&self, plan_id: &str) -> Option<PlanInstance> {
        let handle = self.inner.handle(plan_id)?;
        let machine = handle.machine.lock().await;
        Some(machine.plan().clone())
    }

    pub async fn plan_status(&self, plan_id: &str) -> Option<PlanStatus> {
        let handle = self.inner.handle(plan_id)?;
        let machine = handle.machine.lock().await;
        Some(machine.compute_plan_status())
    }

    /// All registered plans as `(id, name, status, created_at)`
    pub async fn list_plans(
        &self,
        filter: Option<PlanStatus>,
    ) -> Vec<(PlanId, String, PlanStatus, chrono::DateTime<Utc>)> {
        let handles: Vec<Arc<PlanHandle>> = {
            let plans = self.inner.plans.lock().unwrap_or_else(|e| e.into_inner());
            plans.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let machine = handle.machine.lock().await;
            let status = machine.compute_plan_status();
            if filter.is_some_and(|f| f != status) {
                continue;
            }
            let plan = machine.plan();
            out.push((
                plan.id.clone(),
                plan.spec.name.clone(),
                status,
                plan.created_at,
            ));
        }
        out.sort_by(|a, b| a.3.cmp(&b.3));
        out
    }

    /// Node plus its execution state, addressed by node id or producer id
    pub async fn node_details(
        &self,
        plan_id: &str,
        node_ref: &str,
    ) -> Option<(JobNode, NodeExecutionState)> {
        let handle = self.inner.handle(plan_id)?;
        let node_id = self.resolve_node_id(&handle, node_ref).await.ok()?;
        let machine = handle.machine.lock().await;
        let plan = machine.plan();
        Some((
            plan.nodes.get(&node_id)?.clone(),
            plan.node_states.get(&node_id)?.clone(),
        ))
    }

    /// Tail of the latest attempt's log
    pub async fn node_logs(
        &self,
        plan_id: &str,
        node_ref: &str,
        tail: Option<usize>,
    ) -> Option<Vec<crate::domain::LogEntry>> {
        let handle = self.inner.handle(plan_id)?;
        let node_id = self.resolve_node_id(&handle, node_ref).await.ok()?;
        let attempt = {
            let machine = handle.machine.lock().await;
            machine.get_node_state(&node_id)?.attempts.max(1)
        };
        let key = log_key(plan_id, &node_id, attempt);
        Some(match tail {
            Some(n) => self.inner.logs.read_tail(&key, n),
            None => self.inner.logs.read_all(&key),
        })
    }

    /// Resolve a producer id or internal id to the internal id
    async fn resolve_node_id(&self, handle: &Arc<PlanHandle>, node_ref: &str) -> Result<NodeId> {
        let machine = handle.machine.lock().await;
        let plan = machine.plan();
        if let Some(id) = plan.producer_id_to_node_id.get(node_ref) {
            return Ok(id.clone());
        }
        if plan.nodes.contains_key(node_ref) {
            return Ok(node_ref.to_string());
        }
        bail!("Unknown node {node_ref} in plan {}", handle.id)
    }

    fn require(&self, plan_id: &str) -> Result<Arc<PlanHandle>> {
        self.inner
            .handle(plan_id)
            .with_context(|| format!("Unknown plan {plan_id}"))
    }

    /// Replace one phase spec of an editable node with the contents of a
    /// file inside the workspace boundary
    pub async fn import_node_spec(
        &self,
        plan_id: &str,
        node_ref: &str,
        phase: &str,
        path: &Path,
    ) -> Result<()> {
        if !matches!(phase, "work" | "prechecks" | "postchecks") {
            bail!("Unknown spec phase \"{phase}\"");
        }
        let handle = self.require(plan_id)?;
        let node_id = self.resolve_node_id(&handle, node_ref).await?;

        let content = import_spec_file(&self.inner.config.repo_path, path)?;
        let spec = WorkSpec::parse_str(&content)?;

        let producer_id = {
            let mut machine = handle.machine.lock().await;
            let plan = machine.plan();
            if !plan.is_modifiable() {
                bail!("Plan {plan_id} has ended and can no longer be edited");
            }
            let status = plan.node_states[&node_id].status;
            if !matches!(
                status,
                NodeStatus::Pending | NodeStatus::Ready | NodeStatus::Failed
            ) {
                bail!("Node {node_ref} is {status} and cannot take a new spec");
            }

            let plan = machine.plan_mut();
            let node = plan.nodes.get_mut(&node_id).expect("resolved above");
            match phase {
                "work" => node.work = Some(spec.clone()),
                "prechecks" => node.prechecks = Some(spec.clone()),
                _ => node.postchecks = Some(spec.clone()),
            }
            let producer_id = node.producer_id.clone();
            plan.touch();
            self.inner.persist(&machine);
            producer_id
        };

        save_node_spec(&self.inner.store.plan_dir(plan_id), &producer_id, phase, &spec)?;
        tracing::info!(
            "Imported {phase} spec for node {producer_id} from {}",
            path.display()
        );
        Ok(())
    }

    /// Run a reshape edit under the plan lock and persist on success
    pub async fn reshape<T>(
        &self,
        plan_id: &str,
        edit: impl FnOnce(&mut PlanStateMachine) -> Result<T, plan::ReshapeError>,
    ) -> Result<T, plan::ReshapeError> {
        let handle = self
            .require(plan_id)
            .map_err(|e| plan::ReshapeError(format!("{e:#}")))?;
        let mut machine = handle.machine.lock().await;
        let out = edit(&mut machine)?;
        self.inner.persist(&machine);
        drop(machine);
        handle.wake.notify_one();
        Ok(out)
    }

    /// Observe every plan's events
    pub fn subscribe(&self) -> UnboundedReceiver<PlanEvent> {
        let (tx, rx) = unbounded_channel();
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn set_global_max_parallel(&self, n: usize) {
        self.inner.global_max_parallel.store(n.max(1), Ordering::SeqCst);
    }

    pub fn global_max_parallel(&self) -> usize {
        self.inner.global_max_parallel.load(Ordering::SeqCst)
    }

    /// Block until the plan reaches a terminal status
    pub async fn wait_for_plan(&self, plan_id: &str) -> Result<PlanStatus> {
        loop {
            let status = self
                .plan_status(plan_id)
                .await
                .with_context(|| format!("Unknown plan {plan_id}"))?;
            if status.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Cancel everything and wait for loops to drain
    pub async fn shutdown(&self) {
        let ids: Vec<PlanId> = {
            let plans = self.inner.plans.lock().unwrap_or_else(|e| e.into_inner());
            plans.keys().cloned().collect()
        };
        for plan_id in ids {
            let status = self.plan_status(&plan_id).await;
            if status.is_some_and(|s| !s.is_terminal())
                && let Err(e) = self.cancel(&plan_id).await
            {
                tracing::warn!("Failed to cancel plan {plan_id} on shutdown: {e:#}");
            }
        }
        // Give in-flight drivers a moment to observe cancellation.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// One iteration: claim ready nodes under the lock, spawn a driver per
/// claim, sleep when there is nothing to do.
async fn run_loop(inner: Arc<RunnerInner>, handle: Arc<PlanHandle>) {
    tracing::debug!("Run loop started for plan {}", handle.id);
    loop {
        enum Step {
            Launch(Vec<NodeId>),
            Idle,
            Done,
        }

        let step = {
            let mut machine = handle.machine.lock().await;
            if machine.plan().ended_at.is_some() {
                Step::Done
            } else if machine.plan().is_paused {
                Step::Idle
            } else {
                let selected = scheduler::select_nodes(
                    &machine,
                    inner.global_running.load(Ordering::SeqCst),
                    inner.global_max_parallel.load(Ordering::SeqCst),
                );
                let mut claimed = Vec::new();
                for node_id in selected {
                    if machine.transition(&node_id, NodeStatus::Scheduled, Default::default()) {
                        claimed.push(node_id);
                    }
                }
                if claimed.is_empty() {
                    Step::Idle
                } else {
                    inner.persist(&machine);
                    Step::Launch(claimed)
                }
            }
        };

        match step {
            Step::Done => break,
            Step::Launch(ids) => {
                for node_id in ids {
                    inner.global_running.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(drive::drive_node(
                        inner.clone(),
                        handle.clone(),
                        node_id,
                    ));
                }
            }
            Step::Idle => {
                tokio::select! {
                    _ = handle.wake.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
            }
        }
    }
    handle.loop_running.store(false, Ordering::SeqCst);
    tracing::debug!("Run loop finished for plan {}", handle.id);
}
