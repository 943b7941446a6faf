//! Nodes and their lifecycle statuses

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::WorkSpec;

/// Opaque internal node identifier (UUID in practice)
pub type NodeId = String;

/// The lifecycle status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Waiting for dependencies to succeed
    Pending,
    /// All dependencies succeeded; eligible for scheduling
    Ready,
    /// Selected by the scheduler, worktree being prepared
    Scheduled,
    /// Executing phases
    Running,
    /// All phases completed
    Succeeded,
    /// A phase failed
    Failed,
    /// A dependency failed, blocked, or was canceled
    Blocked,
    /// Canceled by the user
    Canceled,
}

impl NodeStatus {
    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Canceled
        )
    }

    /// The allowed transition table
    pub fn can_transition_to(&self, to: NodeStatus) -> bool {
        use NodeStatus::*;
        match self {
            Pending => matches!(to, Ready | Blocked | Canceled),
            Ready => matches!(to, Scheduled | Blocked | Canceled),
            Scheduled => matches!(to, Running | Failed | Canceled),
            Running => matches!(to, Succeeded | Failed | Canceled),
            Succeeded | Failed | Blocked | Canceled => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Scheduled => "scheduled",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Blocked => "blocked",
            NodeStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of work in the plan DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNode {
    /// Unique internal identifier
    pub id: NodeId,

    /// User-chosen identifier, unique within the plan, used in dependency refs
    pub producer_id: String,

    /// Display name
    pub name: String,

    /// Task description
    pub task: String,

    /// Main work spec (a node without one only coordinates)
    #[serde(default)]
    pub work: Option<WorkSpec>,

    /// Checks run before the work phase
    #[serde(default)]
    pub prechecks: Option<WorkSpec>,

    /// Checks run after the commit phase
    #[serde(default)]
    pub postchecks: Option<WorkSpec>,

    /// Extra hint passed to agent work specs
    #[serde(default)]
    pub instructions: Option<String>,

    /// Override of the plan's base branch for this node
    #[serde(default)]
    pub base_branch: Option<String>,

    /// Slash-separated group path for display and aggregation
    #[serde(default)]
    pub group: Option<String>,

    /// The work is validation only; a dirty working copy after work is an error
    #[serde(default)]
    pub expects_no_changes: bool,

    /// Run a corrective agent on phase failure before retrying
    #[serde(default)]
    pub auto_heal: bool,

    /// Upstream node ids (edges into this node)
    #[serde(default)]
    pub dependencies: Vec<NodeId>,

    /// Downstream node ids (reverse index, computed by the builder)
    #[serde(default)]
    pub dependents: Vec<NodeId>,
}

impl JobNode {
    /// Whether this node performs actual work (counts toward per-plan caps)
    pub fn performs_work(&self) -> bool {
        self.work.is_some()
    }

    /// The worktree directory name for this node
    pub fn worktree_dir_name(&self) -> String {
        format!("node-{}", self.producer_id)
    }

    /// The worktree path under a plan's worktree root
    pub fn worktree_path_under(&self, worktree_root: &std::path::Path) -> PathBuf {
        worktree_root.join(self.worktree_dir_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_never_transition() {
        use NodeStatus::*;
        for from in [Succeeded, Failed, Blocked, Canceled] {
            for to in [
                Pending, Ready, Scheduled, Running, Succeeded, Failed, Blocked, Canceled,
            ] {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use NodeStatus::*;
        assert!(Pending.can_transition_to(Ready));
        assert!(Pending.can_transition_to(Blocked));
        assert!(Pending.can_transition_to(Canceled));
        assert!(!Pending.can_transition_to(Running));
        assert!(Ready.can_transition_to(Scheduled));
        assert!(!Ready.can_transition_to(Running));
        assert!(Scheduled.can_transition_to(Running));
        assert!(Scheduled.can_transition_to(Failed));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Blocked));
    }
}
