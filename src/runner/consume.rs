//! Consumption accounting for safe worktree reclamation
//!
//! A producer's worktree may be reclaimed only after every consumer has
//! taken its output: each DAG dependent acknowledges a successful forward
//! integration, and a leaf's single consumer is the target branch.

use crate::domain::{NodeStatus, PlanInstance};

/// Record that `consumer` successfully forward-integrated `producer`.
/// Idempotent: acknowledging the same pair twice is a no-op.
pub fn acknowledge_consumption(
    plan: &mut PlanInstance,
    producer_id: &str,
    consumer_id: &str,
) -> bool {
    let Some(state) = plan.node_states.get_mut(producer_id) else {
        return false;
    };
    if state
        .consumed_by_dependents
        .iter()
        .any(|c| c == consumer_id)
    {
        return false;
    }
    state.consumed_by_dependents.push(consumer_id.to_string());
    state.version += 1;
    plan.touch();
    true
}

/// Whether every consumer of a node has taken its output
pub fn all_consumers_consumed(plan: &PlanInstance, node_id: &str) -> bool {
    let Some(node) = plan.nodes.get(node_id) else {
        return false;
    };
    let Some(state) = plan.node_states.get(node_id) else {
        return false;
    };

    if node.dependents.is_empty() {
        // A leaf's consumer is the target branch.
        plan.target_branch.trim().is_empty() || state.merged_to_target
    } else {
        node.dependents
            .iter()
            .all(|dep| state.consumed_by_dependents.contains(dep))
    }
}

/// Whether a node's worktree can be reclaimed right now
pub fn cleanup_candidate(plan: &PlanInstance, node_id: &str) -> bool {
    if !plan.clean_up_successful_work {
        return false;
    }
    let Some(state) = plan.node_states.get(node_id) else {
        return false;
    };
    if state.worktree_cleaned_up || state.worktree_path.is_none() {
        return false;
    }
    // Never reclaim under a live process.
    if matches!(state.status, NodeStatus::Scheduled | NodeStatus::Running) {
        return false;
    }
    if state.status != NodeStatus::Succeeded {
        return false;
    }
    all_consumers_consumed(plan, node_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobNodeSpec, PlanSpec};
    use crate::plan::{BuildOptions, build_plan};

    fn diamond_plan() -> PlanInstance {
        // S6 shape: a -> b, a -> c, b -> d, c -> d.
        let job = |producer_id: &str, deps: &[&str]| JobNodeSpec {
            producer_id: producer_id.to_string(),
            task: "t".to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        };
        let spec = PlanSpec {
            name: "diamond".to_string(),
            jobs: vec![
                job("aaa", &[]),
                job("bbb", &["aaa"]),
                job("ccc", &["aaa"]),
                job("ddd", &["bbb", "ccc"]),
            ],
            ..Default::default()
        };
        build_plan(&spec, BuildOptions::default()).unwrap()
    }

    #[test]
    fn consumption_is_tracked_per_dependent_and_idempotent() {
        let mut plan = diamond_plan();
        let a = plan.node_id_of("aaa").unwrap().clone();
        let b = plan.node_id_of("bbb").unwrap().clone();
        let c = plan.node_id_of("ccc").unwrap().clone();

        assert!(!all_consumers_consumed(&plan, &a));

        assert!(acknowledge_consumption(&mut plan, &a, &b));
        assert_eq!(plan.node_states[&a].consumed_by_dependents, vec![b.clone()]);
        assert!(!all_consumers_consumed(&plan, &a));

        // Second ack of the same pair is a no-op.
        let version = plan.state_version;
        assert!(!acknowledge_consumption(&mut plan, &a, &b));
        assert_eq!(plan.state_version, version);

        assert!(acknowledge_consumption(&mut plan, &a, &c));
        assert!(all_consumers_consumed(&plan, &a));
    }

    #[test]
    fn leaf_consumer_is_the_target_branch() {
        let mut plan = diamond_plan();
        let sv = plan.snapshot_validation_node_id().unwrap().clone();

        assert!(!all_consumers_consumed(&plan, &sv));
        plan.node_states.get_mut(&sv).unwrap().merged_to_target = true;
        assert!(all_consumers_consumed(&plan, &sv));
    }

    #[test]
    fn cleanup_requires_success_consumption_and_flag() {
        let mut plan = diamond_plan();
        let a = plan.node_id_of("aaa").unwrap().clone();
        let b = plan.node_id_of("bbb").unwrap().clone();
        let c = plan.node_id_of("ccc").unwrap().clone();

        {
            let state = plan.node_states.get_mut(&a).unwrap();
            state.status = NodeStatus::Succeeded;
            state.worktree_path = Some("/tmp/wt".into());
        }
        assert!(!cleanup_candidate(&plan, &a));

        acknowledge_consumption(&mut plan, &a, &b);
        acknowledge_consumption(&mut plan, &a, &c);
        assert!(cleanup_candidate(&plan, &a));

        plan.clean_up_successful_work = false;
        assert!(!cleanup_candidate(&plan, &a));
    }
}
