//! Group hierarchy for display and aggregation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{NodeId, PlanStatus};

/// Opaque internal group identifier
pub type GroupId = String;

/// A hierarchical folder of nodes, keyed by slash-separated path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInstance {
    pub id: GroupId,

    /// Last path segment
    pub name: String,

    /// Full slash-separated path (e.g. `backend/api`)
    pub path: String,

    #[serde(default)]
    pub parent_group_id: Option<GroupId>,

    #[serde(default)]
    pub child_group_ids: Vec<GroupId>,

    /// Nodes directly in this group
    #[serde(default)]
    pub node_ids: Vec<NodeId>,

    /// Nodes in this group and all descendants
    #[serde(default)]
    pub all_node_ids: Vec<NodeId>,

    pub total_nodes: usize,
}

/// Aggregated execution state of a group, derived from member node states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupExecutionState {
    pub status: PlanStatus,

    /// Bumped on every recomputation that changes the state
    pub version: u64,

    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub blocked: usize,
    pub canceled: usize,

    /// Earliest member start
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// Latest member end
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl GroupExecutionState {
    pub fn new() -> Self {
        Self {
            status: PlanStatus::Pending,
            version: 1,
            running: 0,
            succeeded: 0,
            failed: 0,
            blocked: 0,
            canceled: 0,
            started_at: None,
            ended_at: None,
        }
    }
}

impl Default for GroupExecutionState {
    fn default() -> Self {
        Self::new()
    }
}
