//! Plan records: the user-authored spec and the built instance

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::{GroupExecutionState, GroupId, GroupInstance, JobNode, NodeExecutionState, NodeId};

/// Opaque plan identifier (UUID in practice)
pub type PlanId = String;

/// Producer id of the injected terminal validation node
pub const SNAPSHOT_VALIDATION_PRODUCER_ID: &str = "__snapshot-validation__";

/// Display name of the injected terminal validation node
pub const SNAPSHOT_VALIDATION_NAME: &str = "Snapshot Validation";

/// Auto-created group joined by the snapshot-validation node when the plan
/// declares any group
pub const FINAL_MERGE_VALIDATION_GROUP: &str = "Final Merge Validation";

/// The derived status of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    /// Some nodes succeeded, some failed or were blocked
    Partial,
    Canceled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Succeeded | PlanStatus::Failed | PlanStatus::Partial | PlanStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Running => "running",
            PlanStatus::Paused => "paused",
            PlanStatus::Succeeded => "succeeded",
            PlanStatus::Failed => "failed",
            PlanStatus::Partial => "partial",
            PlanStatus::Canceled => "canceled",
        }
    }

    /// Parse a status filter value (e.g. from `list_plans`)
    pub fn parse_filter(raw: &str) -> Option<PlanStatus> {
        match raw {
            "pending" => Some(PlanStatus::Pending),
            "running" => Some(PlanStatus::Running),
            "paused" => Some(PlanStatus::Paused),
            "succeeded" => Some(PlanStatus::Succeeded),
            "failed" => Some(PlanStatus::Failed),
            "partial" => Some(PlanStatus::Partial),
            "canceled" => Some(PlanStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user-authored node spec, as accepted by the builder and the control plane
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobNodeSpec {
    /// Lowercase kebab identifier, unique within the plan
    #[serde(alias = "producerId")]
    pub producer_id: String,

    /// Task description
    pub task: String,

    /// Display name (defaults to the producer id)
    #[serde(default)]
    pub name: Option<String>,

    /// Producer ids this node depends on
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Work spec (string or structured object; normalized by the builder)
    #[serde(default)]
    pub work: Option<serde_json::Value>,

    #[serde(default)]
    pub prechecks: Option<serde_json::Value>,

    #[serde(default)]
    pub postchecks: Option<serde_json::Value>,

    #[serde(default)]
    pub instructions: Option<String>,

    #[serde(default)]
    pub group: Option<String>,

    #[serde(default, alias = "baseBranch")]
    pub base_branch: Option<String>,

    #[serde(default, alias = "expectsNoChanges")]
    pub expects_no_changes: Option<bool>,

    #[serde(default, alias = "autoHeal")]
    pub auto_heal: Option<bool>,

    /// Legacy recursive node kind. Recognized so the builder can reject it
    /// with a clear error instead of a generic parse failure.
    #[serde(default, alias = "subPlan")]
    pub sub_plan: Option<serde_json::Value>,
}

/// A user-authored plan spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,

    #[serde(default, alias = "baseBranch")]
    pub base_branch: Option<String>,

    #[serde(default, alias = "targetBranch")]
    pub target_branch: Option<String>,

    /// Per-plan concurrency cap; 0 means unlimited
    #[serde(default, alias = "maxParallel")]
    pub max_parallel: Option<u32>,

    #[serde(default, alias = "cleanUpSuccessfulWork")]
    pub clean_up_successful_work: Option<bool>,

    /// Plan-level auto-heal default for all nodes
    #[serde(default, alias = "autoHeal")]
    pub auto_heal: Option<bool>,

    /// Verification run by the snapshot-validation node before the final merge
    #[serde(default, alias = "verifyRi")]
    pub verify_ri: Option<serde_json::Value>,

    #[serde(default)]
    pub jobs: Vec<JobNodeSpec>,
}

/// A built plan: immutable topology plus mutable per-node state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanInstance {
    pub id: PlanId,

    /// The spec the plan was built from
    pub spec: PlanSpec,

    #[serde(with = "entry_map")]
    pub nodes: HashMap<NodeId, JobNode>,

    #[serde(with = "entry_map")]
    pub producer_id_to_node_id: HashMap<String, NodeId>,

    #[serde(with = "entry_map")]
    pub node_states: HashMap<NodeId, NodeExecutionState>,

    #[serde(with = "entry_map")]
    pub groups: HashMap<GroupId, GroupInstance>,

    #[serde(with = "entry_map")]
    pub group_states: HashMap<GroupId, GroupExecutionState>,

    #[serde(with = "entry_map")]
    pub group_path_to_id: HashMap<String, GroupId>,

    /// Nodes with no dependencies
    pub roots: Vec<NodeId>,

    /// Nodes with no dependents (after building: the snapshot-validation node)
    pub leaves: Vec<NodeId>,

    pub repo_path: PathBuf,
    pub base_branch: String,
    pub target_branch: String,
    pub worktree_root: PathBuf,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,

    /// Bumped on every mutation to nodes, states, or groups
    pub state_version: u64,

    pub clean_up_successful_work: bool,

    /// Per-plan concurrency cap; 0 means unlimited
    pub max_parallel: u32,

    #[serde(default)]
    pub is_paused: bool,

    /// Set when this plan was spawned on behalf of another plan's node
    #[serde(default)]
    pub parent_plan_id: Option<PlanId>,

    #[serde(default)]
    pub parent_node_id: Option<NodeId>,
}

impl PlanInstance {
    /// Look up a node id by producer id
    pub fn node_id_of(&self, producer_id: &str) -> Option<&NodeId> {
        self.producer_id_to_node_id.get(producer_id)
    }

    /// Look up a node by producer id
    pub fn node_by_producer(&self, producer_id: &str) -> Option<&JobNode> {
        self.node_id_of(producer_id).and_then(|id| self.nodes.get(id))
    }

    /// The injected snapshot-validation node id
    pub fn snapshot_validation_node_id(&self) -> Option<&NodeId> {
        self.node_id_of(SNAPSHOT_VALIDATION_PRODUCER_ID)
    }

    /// Whether the plan can still be reshaped: not yet started, or started
    /// but not ended (paused counts as modifiable)
    pub fn is_modifiable(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Bump the state version; every mutation path funnels through this
    pub fn touch(&mut self) {
        self.state_version += 1;
    }
}

/// Serialize maps as arrays of `[key, value]` entries.
///
/// The on-disk snapshot format keeps maps as entry arrays; readers
/// reconstitute them into maps.
pub mod entry_map {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;
    use std::hash::Hash;

    pub fn serialize<S, K, V>(map: &HashMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        K: Serialize + Ord,
        V: Serialize,
    {
        let mut entries: Vec<(&K, &V)> = map.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<HashMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
        K: DeserializeOwned + Eq + Hash,
        V: DeserializeOwned,
    {
        let entries: Vec<(K, V)> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_job_spec_fields_are_rejected() {
        let raw = r#"{"producer_id":"build","task":"x","bogus":1}"#;
        assert!(serde_json::from_str::<JobNodeSpec>(raw).is_err());
    }

    #[test]
    fn sub_plan_alias_is_recognized() {
        let raw = r#"{"producer_id":"build","task":"x","subPlan":{"jobs":[]}}"#;
        let spec: JobNodeSpec = serde_json::from_str(raw).unwrap();
        assert!(spec.sub_plan.is_some());
    }

    #[test]
    fn status_filter_rejects_unknown_values() {
        assert_eq!(PlanStatus::parse_filter("running"), Some(PlanStatus::Running));
        assert_eq!(PlanStatus::parse_filter("exploded"), None);
    }
}
