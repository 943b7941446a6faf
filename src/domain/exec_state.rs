//! Mutable per-node execution state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::{NodeId, NodeStatus, Phase};

/// Why a node ended up failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureReason {
    /// The process vanished while the node was recorded as running
    Crashed,
    /// A spec-supplied timeout elapsed
    Timeout,
    /// User-initiated abort
    Abort,
    /// Ordinary phase failure
    Error,
}

/// Per-phase sub-status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// Diff statistics for a node's work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkSummary {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub commit_count: usize,
}

/// Immutable record of one past attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt number (1-based)
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Terminal status the attempt reached
    pub status: NodeStatus,
    #[serde(default)]
    pub failed_phase: Option<Phase>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Agent session id captured during the attempt, for resumption
    #[serde(default)]
    pub agent_session_id: Option<String>,
    #[serde(default)]
    pub step_statuses: Option<BTreeMap<Phase, StepStatus>>,
}

/// Mutable execution state of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionState {
    pub status: NodeStatus,

    /// Monotonically increasing, bumped on every mutation
    pub version: u64,

    /// Number of execution attempts so far
    pub attempts: u32,

    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,

    /// OS pid of the in-flight work process, for crash detection
    #[serde(default)]
    pub pid: Option<u32>,

    /// The parent commit the worktree was created from
    #[serde(default)]
    pub base_commit: Option<String>,

    /// Final commit after the work phase committed
    #[serde(default)]
    pub completed_commit: Option<String>,

    #[serde(default)]
    pub worktree_path: Option<PathBuf>,

    /// Diff vs the node's own base commit
    #[serde(default)]
    pub work_summary: Option<WorkSummary>,

    /// Leaf-only: diff vs the plan's base branch
    #[serde(default)]
    pub aggregated_work_summary: Option<WorkSummary>,

    /// Leaf-only: the final merge into the target branch happened
    #[serde(default)]
    pub merged_to_target: bool,

    #[serde(default)]
    pub worktree_cleaned_up: bool,

    /// Dependents that acknowledged consuming this node's output
    #[serde(default)]
    pub consumed_by_dependents: Vec<NodeId>,

    #[serde(default)]
    pub step_statuses: Option<BTreeMap<Phase, StepStatus>>,

    /// Agent session id from the latest run, for `--resume`
    #[serde(default)]
    pub agent_session_id: Option<String>,

    #[serde(default)]
    pub last_attempt: Option<AttemptRecord>,

    #[serde(default)]
    pub attempt_history: Vec<AttemptRecord>,
}

impl NodeExecutionState {
    pub fn new(status: NodeStatus) -> Self {
        Self {
            status,
            version: 1,
            attempts: 0,
            scheduled_at: None,
            started_at: None,
            ended_at: None,
            error: None,
            failure_reason: None,
            pid: None,
            base_commit: None,
            completed_commit: None,
            worktree_path: None,
            work_summary: None,
            aggregated_work_summary: None,
            merged_to_target: false,
            worktree_cleaned_up: false,
            consumed_by_dependents: Vec::new(),
            step_statuses: None,
            agent_session_id: None,
            last_attempt: None,
            attempt_history: Vec::new(),
        }
    }
}
