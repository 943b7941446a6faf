//! Events emitted by the state machine

use serde::{Deserialize, Serialize};

use super::{NodeId, NodeStatus, PlanId, PlanStatus};

/// A single node transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub plan_id: PlanId,
    pub node_id: NodeId,
    pub from: NodeStatus,
    pub to: NodeStatus,
    /// Node state version after the transition
    pub version: u64,
}

/// Events delivered in emission order, single-threaded per plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanEvent {
    Transition(TransitionEvent),
    NodeReady { plan_id: PlanId, node_id: NodeId },
    PlanComplete { plan_id: PlanId, status: PlanStatus },
}
