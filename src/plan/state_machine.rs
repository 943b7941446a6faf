//! Per-node state machine with dependency propagation
//!
//! Single source of truth for mutation: every status change funnels through
//! [`PlanStateMachine::transition`], which enforces the transition table,
//! manages timestamps, propagates success/failure across edges, keeps group
//! aggregates current, and detects plan completion. All operations here are
//! synchronous and never suspend.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedSender;

use crate::domain::{
    AttemptRecord, FailureReason, GroupId, NodeExecutionState, NodeId, NodeStatus, Phase,
    PlanEvent, PlanInstance, PlanStatus, StepStatus, TransitionEvent, WorkSummary,
};

/// Optional fields applied atomically with a transition
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub error: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub completed_commit: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub base_commit: Option<String>,
    pub work_summary: Option<WorkSummary>,
    pub aggregated_work_summary: Option<WorkSummary>,
    pub merged_to_target: Option<bool>,
    pub worktree_cleaned_up: Option<bool>,
    pub agent_session_id: Option<String>,
    pub last_attempt: Option<AttemptRecord>,
    pub pid: Option<u32>,
    pub failure_reason: Option<FailureReason>,
    pub step_statuses: Option<BTreeMap<Phase, StepStatus>>,
}

impl TransitionFields {
    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Owns a [`PlanInstance`] and serializes all mutation on it
pub struct PlanStateMachine {
    plan: PlanInstance,
    events: Option<UnboundedSender<PlanEvent>>,
}

impl PlanStateMachine {
    pub fn new(plan: PlanInstance) -> Self {
        Self { plan, events: None }
    }

    /// Wire the event sink. Sends are non-blocking; a dropped receiver is
    /// tolerated.
    pub fn set_event_sender(&mut self, sender: UnboundedSender<PlanEvent>) {
        self.events = Some(sender);
    }

    pub fn plan(&self) -> &PlanInstance {
        &self.plan
    }

    /// Direct mutable access for the runner and reshaper. Callers are
    /// responsible for bumping `state_version` via `touch` on mutation.
    pub fn plan_mut(&mut self) -> &mut PlanInstance {
        &mut self.plan
    }

    pub fn into_plan(self) -> PlanInstance {
        self.plan
    }

    fn emit(&self, event: PlanEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }

    /// Transition a node. Returns false (state unchanged) when the node is
    /// unknown or the transition is not in the table.
    pub fn transition(&mut self, node_id: &str, to: NodeStatus, fields: TransitionFields) -> bool {
        self.transition_inner(node_id, to, fields, true)
    }

    fn transition_inner(
        &mut self,
        node_id: &str,
        to: NodeStatus,
        fields: TransitionFields,
        propagate: bool,
    ) -> bool {
        if !self.plan.nodes.contains_key(node_id) {
            return false;
        }
        let Some(state) = self.plan.node_states.get_mut(node_id) else {
            return false;
        };
        if !state.status.can_transition_to(to) {
            return false;
        }
        let from = state.status;

        state.status = to;
        state.version += 1;
        apply_fields(state, fields);

        // Automatic field management; caller-provided values win.
        let now = Utc::now();
        match to {
            NodeStatus::Scheduled => {
                if state.scheduled_at.is_none() {
                    state.scheduled_at = Some(now);
                }
            }
            NodeStatus::Running => {
                if state.started_at.is_none() {
                    state.started_at = Some(now);
                }
                state.attempts += 1;
            }
            _ if to.is_terminal() => {
                if state.ended_at.is_none() {
                    state.ended_at = Some(now);
                }
            }
            _ => {}
        }

        let version = state.version;
        self.plan.touch();
        self.emit(PlanEvent::Transition(TransitionEvent {
            plan_id: self.plan.id.clone(),
            node_id: node_id.to_string(),
            from,
            to,
            version,
        }));
        if to == NodeStatus::Ready {
            self.emit(PlanEvent::NodeReady {
                plan_id: self.plan.id.clone(),
                node_id: node_id.to_string(),
            });
        }

        if propagate {
            self.propagate(node_id, to);
        }

        self.recompute_group_chain(node_id);
        self.check_completion();
        true
    }

    /// Synchronous dependency propagation, per the rules for the entered
    /// status.
    fn propagate(&mut self, node_id: &str, entered: NodeStatus) {
        let dependents = match self.plan.nodes.get(node_id) {
            Some(node) => node.dependents.clone(),
            None => return,
        };

        match entered {
            NodeStatus::Succeeded => {
                for dep_id in dependents {
                    if self.get_node_status(&dep_id) == Some(NodeStatus::Pending)
                        && self.are_dependencies_met(&dep_id)
                    {
                        self.transition_inner(&dep_id, NodeStatus::Ready, Default::default(), true);
                    }
                }
            }
            NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Canceled => {
                let error = format!("blocked: dependency {} {}", node_id, entered);
                for dep_id in dependents {
                    let status = self.get_node_status(&dep_id);
                    if status.is_some_and(|s| !s.is_terminal()) {
                        // Recursion cascades the block transitively.
                        self.transition_inner(
                            &dep_id,
                            NodeStatus::Blocked,
                            TransitionFields::with_error(error.clone()),
                            true,
                        );
                    }
                }
            }
            _ => {}
        }
    }

    /// Reset a node for retry. The node moves to `ready` when its
    /// dependencies are met, else `pending`; every transitively-downstream
    /// `blocked` node is unblocked the same way.
    pub fn reset_node_to_pending(&mut self, node_id: &str) -> bool {
        if !self.plan.nodes.contains_key(node_id) {
            return false;
        }
        let deps_met = self.are_dependencies_met(node_id);
        let to = if deps_met {
            NodeStatus::Ready
        } else {
            NodeStatus::Pending
        };

        let Some(state) = self.plan.node_states.get_mut(node_id) else {
            return false;
        };
        let from = state.status;
        reset_for_retry(state, to);
        let version = state.version;

        // The plan is live again; completion may re-fire later.
        self.plan.ended_at = None;
        self.plan.touch();

        self.emit(PlanEvent::Transition(TransitionEvent {
            plan_id: self.plan.id.clone(),
            node_id: node_id.to_string(),
            from,
            to,
            version,
        }));
        if to == NodeStatus::Ready {
            self.emit(PlanEvent::NodeReady {
                plan_id: self.plan.id.clone(),
                node_id: node_id.to_string(),
            });
        }

        self.unblock_downstream(node_id);
        self.recompute_group_chain(node_id);
        true
    }

    fn unblock_downstream(&mut self, node_id: &str) {
        let dependents = match self.plan.nodes.get(node_id) {
            Some(node) => node.dependents.clone(),
            None => return,
        };

        for dep_id in dependents {
            if self.get_node_status(&dep_id) != Some(NodeStatus::Blocked) {
                continue;
            }
            let to = if self.are_dependencies_met(&dep_id) {
                NodeStatus::Ready
            } else {
                NodeStatus::Pending
            };
            let state = self
                .plan
                .node_states
                .get_mut(&dep_id)
                .expect("dependent state exists");
            let from = state.status;
            reset_for_retry(state, to);
            let version = state.version;
            self.plan.touch();

            self.emit(PlanEvent::Transition(TransitionEvent {
                plan_id: self.plan.id.clone(),
                node_id: dep_id.clone(),
                from,
                to,
                version,
            }));
            if to == NodeStatus::Ready {
                self.emit(PlanEvent::NodeReady {
                    plan_id: self.plan.id.clone(),
                    node_id: dep_id.clone(),
                });
            }

            self.recompute_group_chain(&dep_id);
            self.unblock_downstream(&dep_id);
        }
    }

    /// Cancel every non-terminal node. Downstream blocking is suppressed so
    /// each node ends `canceled`, not `blocked`.
    pub fn cancel_all(&mut self) {
        let mut pending: Vec<NodeId> = self
            .plan
            .node_states
            .iter()
            .filter(|(_, s)| !s.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        pending.sort();

        for node_id in pending {
            self.transition_inner(&node_id, NodeStatus::Canceled, Default::default(), false);
        }
    }

    // ----- queries ---------------------------------------------------------

    pub fn get_node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.plan.node_states.get(node_id).map(|s| s.status)
    }

    pub fn get_node_state(&self, node_id: &str) -> Option<&NodeExecutionState> {
        self.plan.node_states.get(node_id)
    }

    /// True when every dependency has succeeded
    pub fn are_dependencies_met(&self, node_id: &str) -> bool {
        let Some(node) = self.plan.nodes.get(node_id) else {
            return false;
        };
        node.dependencies
            .iter()
            .all(|dep| self.get_node_status(dep) == Some(NodeStatus::Succeeded))
    }

    /// True when any dependency failed, blocked, or was canceled
    pub fn has_dependency_failed(&self, node_id: &str) -> bool {
        let Some(node) = self.plan.nodes.get(node_id) else {
            return false;
        };
        node.dependencies.iter().any(|dep| {
            matches!(
                self.get_node_status(dep),
                Some(NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Canceled)
            )
        })
    }

    pub fn get_nodes_by_status(&self, status: NodeStatus) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .plan
            .node_states
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn get_ready_nodes(&self) -> Vec<NodeId> {
        self.get_nodes_by_status(NodeStatus::Ready)
    }

    pub fn get_status_counts(&self) -> HashMap<NodeStatus, usize> {
        let mut counts = HashMap::new();
        for state in self.plan.node_states.values() {
            *counts.entry(state.status).or_insert(0) += 1;
        }
        counts
    }

    /// The completed commits of all direct dependencies that have one.
    /// Empty for a root.
    pub fn get_base_commits_for_node(&self, node_id: &str) -> Vec<String> {
        let Some(node) = self.plan.nodes.get(node_id) else {
            return Vec::new();
        };
        node.dependencies
            .iter()
            .filter_map(|dep| self.plan.node_states.get(dep))
            .filter_map(|s| s.completed_commit.clone())
            .collect()
    }

    /// Derive the plan status from node states
    pub fn compute_plan_status(&self) -> PlanStatus {
        let states: Vec<NodeStatus> =
            self.plan.node_states.values().map(|s| s.status).collect();
        let total = states.len();
        let count = |f: fn(&NodeStatus) -> bool| states.iter().filter(|s| f(*s)).count();

        let running = count(|s| matches!(s, NodeStatus::Running | NodeStatus::Scheduled));
        let waiting = count(|s| matches!(s, NodeStatus::Pending | NodeStatus::Ready));
        let succeeded = count(|s| matches!(s, NodeStatus::Succeeded));
        let failed = count(|s| matches!(s, NodeStatus::Failed));
        let blocked = count(|s| matches!(s, NodeStatus::Blocked));
        let canceled = count(|s| matches!(s, NodeStatus::Canceled));

        if self.plan.is_paused && states.iter().any(|s| !s.is_terminal()) {
            return PlanStatus::Paused;
        }
        if running > 0 {
            return PlanStatus::Running;
        }
        if waiting > 0 && self.plan.started_at.is_some() {
            return PlanStatus::Running;
        }
        if canceled > 0 {
            return PlanStatus::Canceled;
        }
        if blocked == total {
            return PlanStatus::Failed;
        }
        if succeeded > 0 && failed + blocked > 0 && waiting == 0 {
            return PlanStatus::Partial;
        }
        if total > 0 && failed + blocked == total {
            return PlanStatus::Failed;
        }
        if total > 0 && succeeded == total {
            return PlanStatus::Succeeded;
        }
        PlanStatus::Pending
    }

    /// Max `ended_at` across all nodes
    pub fn compute_effective_ended_at(&self) -> Option<DateTime<Utc>> {
        self.plan
            .node_states
            .values()
            .filter_map(|s| s.ended_at)
            .max()
    }

    /// The plan's stored `ended_at`, else the computed max
    pub fn get_effective_ended_at(&self) -> Option<DateTime<Utc>> {
        self.plan.ended_at.or_else(|| self.compute_effective_ended_at())
    }

    // ----- group aggregation ----------------------------------------------

    fn recompute_group_chain(&mut self, node_id: &str) {
        let Some(path) = self
            .plan
            .nodes
            .get(node_id)
            .and_then(|n| n.group.clone())
        else {
            return;
        };
        let mut group_id = self.plan.group_path_to_id.get(&path).cloned();
        while let Some(gid) = group_id {
            self.recompute_group(&gid);
            group_id = self
                .plan
                .groups
                .get(&gid)
                .and_then(|g| g.parent_group_id.clone());
        }
    }

    fn recompute_group(&mut self, group_id: &GroupId) {
        let Some(group) = self.plan.groups.get(group_id) else {
            return;
        };
        let node_ids = group.node_ids.clone();
        let child_ids = group.child_group_ids.clone();

        let mut running = 0usize;
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut blocked = 0usize;
        let mut canceled = 0usize;
        let mut started_at: Option<DateTime<Utc>> = None;
        let mut ended_at: Option<DateTime<Utc>> = None;
        let total = node_ids.len() + child_ids.len();

        let mut fold_start = |t: Option<DateTime<Utc>>| {
            if let Some(t) = t {
                started_at = Some(started_at.map_or(t, |cur| cur.min(t)));
            }
        };
        let mut fold_end = |t: Option<DateTime<Utc>>| {
            if let Some(t) = t {
                ended_at = Some(ended_at.map_or(t, |cur| cur.max(t)));
            }
        };

        for node_id in &node_ids {
            let Some(state) = self.plan.node_states.get(node_id) else {
                continue;
            };
            match state.status {
                NodeStatus::Running => running += 1,
                NodeStatus::Succeeded => succeeded += 1,
                NodeStatus::Failed => failed += 1,
                NodeStatus::Blocked => blocked += 1,
                NodeStatus::Canceled => canceled += 1,
                _ => {}
            }
            fold_start(state.started_at);
            fold_end(state.ended_at);
        }
        for child in &child_ids {
            let Some(child_state) = self.plan.group_states.get(child) else {
                continue;
            };
            match child_state.status {
                PlanStatus::Running => running += 1,
                PlanStatus::Succeeded => succeeded += 1,
                // A partial child contains failure.
                PlanStatus::Failed | PlanStatus::Partial => failed += 1,
                PlanStatus::Canceled => canceled += 1,
                _ => {}
            }
            fold_start(child_state.started_at);
            fold_end(child_state.ended_at);
        }

        let had_started = self
            .plan
            .group_states
            .get(group_id)
            .and_then(|s| s.started_at)
            .or(started_at);

        let status = if running > 0 {
            PlanStatus::Running
        } else if failed + blocked > 0 {
            PlanStatus::Failed
        } else if total > 0 && canceled == total {
            PlanStatus::Canceled
        } else if total > 0 && succeeded == total {
            PlanStatus::Succeeded
        } else if had_started.is_some() {
            PlanStatus::Running
        } else {
            PlanStatus::Pending
        };

        let Some(state) = self.plan.group_states.get_mut(group_id) else {
            return;
        };
        state.version += 1;
        state.status = status;
        state.running = running;
        state.succeeded = succeeded;
        state.failed = failed;
        state.blocked = blocked;
        state.canceled = canceled;
        if state.started_at.is_none() {
            state.started_at = started_at;
        }
        state.ended_at = if status.is_terminal() { ended_at } else { None };
        self.plan.touch();
    }

    // ----- completion ------------------------------------------------------

    fn check_completion(&mut self) {
        if self.plan.ended_at.is_some() {
            return;
        }
        let all_terminal = self
            .plan
            .node_states
            .values()
            .all(|s| s.status.is_terminal());
        if !all_terminal {
            return;
        }
        self.plan.ended_at = Some(self.compute_effective_ended_at().unwrap_or_else(Utc::now));
        self.plan.touch();
        let status = self.compute_plan_status();
        self.emit(PlanEvent::PlanComplete {
            plan_id: self.plan.id.clone(),
            status,
        });
    }
}

fn apply_fields(state: &mut NodeExecutionState, fields: TransitionFields) {
    if let Some(v) = fields.error {
        state.error = Some(v);
    }
    if let Some(v) = fields.scheduled_at {
        state.scheduled_at = Some(v);
    }
    if let Some(v) = fields.started_at {
        state.started_at = Some(v);
    }
    if let Some(v) = fields.ended_at {
        state.ended_at = Some(v);
    }
    if let Some(v) = fields.completed_commit {
        state.completed_commit = Some(v);
    }
    if let Some(v) = fields.worktree_path {
        state.worktree_path = Some(v);
    }
    if let Some(v) = fields.base_commit {
        state.base_commit = Some(v);
    }
    if let Some(v) = fields.work_summary {
        state.work_summary = Some(v);
    }
    if let Some(v) = fields.aggregated_work_summary {
        state.aggregated_work_summary = Some(v);
    }
    if let Some(v) = fields.merged_to_target {
        state.merged_to_target = v;
    }
    if let Some(v) = fields.worktree_cleaned_up {
        state.worktree_cleaned_up = v;
    }
    if let Some(v) = fields.agent_session_id {
        state.agent_session_id = Some(v);
    }
    if let Some(v) = fields.last_attempt {
        state.attempt_history.push(v.clone());
        state.last_attempt = Some(v);
    }
    if let Some(v) = fields.pid {
        state.pid = Some(v);
    }
    if let Some(v) = fields.failure_reason {
        state.failure_reason = Some(v);
    }
    if let Some(v) = fields.step_statuses {
        state.step_statuses = Some(v);
    }
}

/// Clear transient fields so the node can run again
fn reset_for_retry(state: &mut NodeExecutionState, to: NodeStatus) {
    state.status = to;
    state.version += 1;
    state.error = None;
    state.failure_reason = None;
    state.scheduled_at = None;
    state.started_at = None;
    state.ended_at = None;
    state.pid = None;
    state.step_statuses = None;
    state.completed_commit = None;
    state.work_summary = None;
    state.aggregated_work_summary = None;
    state.merged_to_target = false;
    state.worktree_cleaned_up = false;
    state.consumed_by_dependents.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobNodeSpec, PlanSpec};
    use crate::plan::builder::{BuildOptions, build_plan};

    fn job(producer_id: &str, deps: &[&str]) -> JobNodeSpec {
        JobNodeSpec {
            producer_id: producer_id.to_string(),
            task: "t".to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    fn machine(jobs: Vec<JobNodeSpec>) -> PlanStateMachine {
        let spec = PlanSpec {
            name: "test".to_string(),
            jobs,
            ..Default::default()
        };
        PlanStateMachine::new(build_plan(&spec, BuildOptions::default()).unwrap())
    }

    fn id_of(sm: &PlanStateMachine, producer: &str) -> String {
        sm.plan().node_id_of(producer).unwrap().clone()
    }

    fn run_to(sm: &mut PlanStateMachine, producer: &str, end: NodeStatus) {
        let id = id_of(sm, producer);
        assert!(sm.transition(&id, NodeStatus::Scheduled, Default::default()));
        assert!(sm.transition(&id, NodeStatus::Running, Default::default()));
        assert!(sm.transition(&id, end, Default::default()));
    }

    #[test]
    fn illegal_transitions_return_false_and_keep_state() {
        let mut sm = machine(vec![job("solo-node", &[])]);
        let id = id_of(&sm, "solo-node");

        assert!(!sm.transition(&id, NodeStatus::Running, Default::default()));
        assert_eq!(sm.get_node_status(&id), Some(NodeStatus::Ready));
        assert!(!sm.transition("no-such-node", NodeStatus::Ready, Default::default()));
    }

    #[test]
    fn success_readies_dependents() {
        let mut sm = machine(vec![job("aaa", &[]), job("bbb", &["aaa"])]);
        let b = id_of(&sm, "bbb");

        run_to(&mut sm, "aaa", NodeStatus::Succeeded);
        assert_eq!(sm.get_node_status(&b), Some(NodeStatus::Ready));
    }

    #[test]
    fn failure_cascades_blocked_transitively() {
        // S2: linear a -> b -> c; failing a blocks b and c.
        let mut sm = machine(vec![job("aaa", &[]), job("bbb", &["aaa"]), job("ccc", &["bbb"])]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        sm.set_event_sender(tx);

        run_to(&mut sm, "aaa", NodeStatus::Failed);

        assert_eq!(sm.get_node_status(&id_of(&sm, "bbb")), Some(NodeStatus::Blocked));
        assert_eq!(sm.get_node_status(&id_of(&sm, "ccc")), Some(NodeStatus::Blocked));
        let b_state = sm.get_node_state(&id_of(&sm, "bbb")).unwrap();
        assert!(b_state.error.as_deref().unwrap().starts_with("blocked: dependency"));

        assert_eq!(sm.compute_plan_status(), PlanStatus::Failed);
        assert!(sm.plan().ended_at.is_some());

        let mut completions = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PlanEvent::PlanComplete { .. }) {
                completions += 1;
            }
        }
        assert_eq!(completions, 1, "planComplete must fire exactly once");
    }

    #[test]
    fn reset_recovers_blocked_chain() {
        // S3: after the cascade, resetting a unblocks b and c recursively.
        let mut sm = machine(vec![job("aaa", &[]), job("bbb", &["aaa"]), job("ccc", &["bbb"])]);
        run_to(&mut sm, "aaa", NodeStatus::Failed);

        assert!(sm.reset_node_to_pending(&id_of(&sm, "aaa")));
        assert_eq!(sm.get_node_status(&id_of(&sm, "aaa")), Some(NodeStatus::Ready));
        assert_eq!(sm.get_node_status(&id_of(&sm, "bbb")), Some(NodeStatus::Pending));
        assert_eq!(sm.get_node_status(&id_of(&sm, "ccc")), Some(NodeStatus::Pending));

        run_to(&mut sm, "aaa", NodeStatus::Succeeded);
        assert_eq!(sm.get_node_status(&id_of(&sm, "bbb")), Some(NodeStatus::Ready));
    }

    #[test]
    fn diamond_requires_all_dependencies() {
        // S4: c depends on both a and b.
        let mut sm = machine(vec![job("aaa", &[]), job("bbb", &[]), job("ccc", &["aaa", "bbb"])]);
        let c = id_of(&sm, "ccc");

        run_to(&mut sm, "aaa", NodeStatus::Succeeded);
        assert_eq!(sm.get_node_status(&c), Some(NodeStatus::Pending));

        run_to(&mut sm, "bbb", NodeStatus::Succeeded);
        assert_eq!(sm.get_node_status(&c), Some(NodeStatus::Ready));
    }

    #[test]
    fn cancel_all_cancels_non_terminal_nodes() {
        let mut sm = machine(vec![job("aaa", &[]), job("bbb", &["aaa"])]);
        run_to(&mut sm, "aaa", NodeStatus::Succeeded);

        sm.cancel_all();

        assert_eq!(sm.get_node_status(&id_of(&sm, "aaa")), Some(NodeStatus::Succeeded));
        assert_eq!(sm.get_node_status(&id_of(&sm, "bbb")), Some(NodeStatus::Canceled));
        assert_eq!(sm.compute_plan_status(), PlanStatus::Canceled);
    }

    #[test]
    fn running_node_gets_started_at_and_attempt() {
        let mut sm = machine(vec![job("solo-node", &[])]);
        let id = id_of(&sm, "solo-node");

        sm.transition(&id, NodeStatus::Scheduled, Default::default());
        sm.transition(&id, NodeStatus::Running, Default::default());

        let state = sm.get_node_state(&id).unwrap();
        assert!(state.scheduled_at.is_some());
        assert!(state.started_at.is_some());
        assert_eq!(state.attempts, 1);
    }

    #[test]
    fn version_increases_on_every_mutation() {
        let mut sm = machine(vec![job("solo-node", &[])]);
        let id = id_of(&sm, "solo-node");
        let v0 = sm.plan().state_version;
        let n0 = sm.get_node_state(&id).unwrap().version;

        sm.transition(&id, NodeStatus::Scheduled, Default::default());

        assert!(sm.plan().state_version > v0);
        assert!(sm.get_node_state(&id).unwrap().version > n0);
    }

    #[test]
    fn base_commits_come_from_direct_dependencies() {
        let mut sm = machine(vec![job("aaa", &[]), job("bbb", &["aaa"])]);
        let a = id_of(&sm, "aaa");
        let b = id_of(&sm, "bbb");

        assert!(sm.get_base_commits_for_node(&a).is_empty());

        sm.transition(&a, NodeStatus::Scheduled, Default::default());
        sm.transition(&a, NodeStatus::Running, Default::default());
        sm.transition(
            &a,
            NodeStatus::Succeeded,
            TransitionFields {
                completed_commit: Some("abc123".to_string()),
                ..Default::default()
            },
        );

        assert_eq!(sm.get_base_commits_for_node(&b), vec!["abc123".to_string()]);
    }

    #[test]
    fn group_aggregation_tracks_member_states() {
        let mut with_group = job("grouped-node", &[]);
        with_group.group = Some("batch".to_string());
        let mut other = job("other-node", &[]);
        other.group = Some("batch".to_string());
        let mut sm = machine(vec![with_group, other]);

        let gid = sm.plan().group_path_to_id["batch"].clone();
        assert_eq!(sm.plan().group_states[&gid].status, PlanStatus::Pending);

        let id = id_of(&sm, "grouped-node");
        sm.transition(&id, NodeStatus::Scheduled, Default::default());
        sm.transition(&id, NodeStatus::Running, Default::default());
        assert_eq!(sm.plan().group_states[&gid].status, PlanStatus::Running);

        sm.transition(&id, NodeStatus::Succeeded, Default::default());
        // One member succeeded, one still pending but the group has started.
        assert_eq!(sm.plan().group_states[&gid].status, PlanStatus::Running);
        assert_eq!(sm.plan().group_states[&gid].succeeded, 1);

        run_to(&mut sm, "other-node", NodeStatus::Succeeded);
        assert_eq!(sm.plan().group_states[&gid].status, PlanStatus::Succeeded);
        assert!(sm.plan().group_states[&gid].ended_at.is_some());
    }

    #[test]
    fn plan_status_derivation_order() {
        let mut sm = machine(vec![job("aaa", &[]), job("bbb", &["aaa"])]);
        assert_eq!(sm.compute_plan_status(), PlanStatus::Pending);

        sm.plan_mut().started_at = Some(Utc::now());
        assert_eq!(sm.compute_plan_status(), PlanStatus::Running);

        sm.plan_mut().is_paused = true;
        assert_eq!(sm.compute_plan_status(), PlanStatus::Paused);
        sm.plan_mut().is_paused = false;

        run_to(&mut sm, "aaa", NodeStatus::Succeeded);
        assert_eq!(sm.compute_plan_status(), PlanStatus::Running);
    }

    #[test]
    fn partial_when_mixed_terminal_outcomes() {
        let mut sm = machine(vec![job("aaa", &[]), job("bbb", &[])]);
        sm.plan_mut().started_at = Some(Utc::now());
        run_to(&mut sm, "aaa", NodeStatus::Succeeded);
        run_to(&mut sm, "bbb", NodeStatus::Failed);
        // Snapshot validation is blocked by b's failure; a succeeded.
        assert_eq!(sm.compute_plan_status(), PlanStatus::Partial);
    }

    #[test]
    fn effective_ended_at_falls_back_to_computed_max() {
        let mut sm = machine(vec![job("aaa", &[])]);
        run_to(&mut sm, "aaa", NodeStatus::Failed);
        assert!(sm.get_effective_ended_at().is_some());
        let stored = sm.plan().ended_at;
        assert_eq!(sm.get_effective_ended_at(), stored);
    }
}
