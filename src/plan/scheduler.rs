//! Ready-node selection under global and per-plan concurrency caps
//!
//! Stateless: reads the plan through the state machine and returns the node
//! ids to launch, highest-leverage first (most dependents, then name).

use crate::domain::{NodeId, NodeStatus};

use super::PlanStateMachine;

/// Default for the process-wide cap; runtime-mutable in the runner.
pub const DEFAULT_GLOBAL_MAX_PARALLEL: usize = 8;

/// Pick up to `capacity` ready nodes to launch.
///
/// `global_running` is the number of nodes in `scheduled|running` across all
/// plans. The per-plan cap only counts nodes that perform work; coordination
/// nodes are free.
pub fn select_nodes(
    machine: &PlanStateMachine,
    global_running: usize,
    global_max: usize,
) -> Vec<NodeId> {
    let plan = machine.plan();

    let global_free = global_max.saturating_sub(global_running);
    if global_free == 0 {
        return Vec::new();
    }

    let per_plan = plan.max_parallel as usize;
    let capacity = if per_plan == 0 {
        global_free
    } else {
        let plan_running = plan
            .node_states
            .iter()
            .filter(|(id, state)| {
                matches!(state.status, NodeStatus::Scheduled | NodeStatus::Running)
                    && plan.nodes.get(*id).is_some_and(|n| n.performs_work())
            })
            .count();
        let plan_free = per_plan.saturating_sub(plan_running);
        if plan_free == 0 {
            return Vec::new();
        }
        global_free.min(plan_free)
    };

    let mut ready: Vec<&NodeId> = machine
        .get_ready_nodes()
        .into_iter()
        .filter_map(|id| plan.nodes.get(&id).map(|n| &n.id))
        .collect();

    ready.sort_by(|a, b| {
        let na = &plan.nodes[*a];
        let nb = &plan.nodes[*b];
        nb.dependents
            .len()
            .cmp(&na.dependents.len())
            .then_with(|| na.name.cmp(&nb.name))
    });

    ready.into_iter().take(capacity).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobNodeSpec, PlanSpec};
    use crate::plan::builder::{BuildOptions, build_plan};

    fn machine(jobs: Vec<JobNodeSpec>, max_parallel: Option<u32>) -> PlanStateMachine {
        let spec = PlanSpec {
            name: "test".to_string(),
            max_parallel,
            jobs,
            ..Default::default()
        };
        PlanStateMachine::new(build_plan(&spec, BuildOptions::default()).unwrap())
    }

    fn job(producer_id: &str, deps: &[&str]) -> JobNodeSpec {
        JobNodeSpec {
            producer_id: producer_id.to_string(),
            task: "t".to_string(),
            name: Some(producer_id.to_string()),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            work: Some(serde_json::json!("true")),
            ..Default::default()
        }
    }

    #[test]
    fn priority_is_dependent_count_then_name() {
        // S7: six roots; "aaa" has 2 dependents, "bbb" has 1, rest 0.
        // With max_parallel = 2 exactly ["aaa", "bbb"] is selected, in order.
        let jobs = vec![
            job("fff", &[]),
            job("eee", &[]),
            job("ddd", &[]),
            job("ccc", &[]),
            job("bbb", &[]),
            job("aaa", &[]),
            job("dep-one", &["aaa"]),
            job("dep-two", &["aaa"]),
            job("dep-three", &["bbb"]),
        ];
        let sm = machine(jobs, Some(2));

        let selected = select_nodes(&sm, 0, 8);
        let producers: Vec<&str> = selected
            .iter()
            .map(|id| sm.plan().nodes[id].producer_id.as_str())
            .collect();
        assert_eq!(producers, vec!["aaa", "bbb"]);
    }

    #[test]
    fn no_global_capacity_selects_nothing() {
        let sm = machine(vec![job("aaa", &[])], None);
        assert!(select_nodes(&sm, 8, 8).is_empty());
        assert!(select_nodes(&sm, 9, 8).is_empty());
    }

    #[test]
    fn per_plan_cap_counts_only_work_nodes() {
        let mut sm = machine(vec![job("aaa", &[]), job("bbb", &[]), job("ccc", &[])], Some(1));
        let a = sm.plan().node_id_of("aaa").unwrap().clone();
        sm.transition(&a, crate::domain::NodeStatus::Scheduled, Default::default());

        // One work node in flight fills the cap of 1.
        assert!(select_nodes(&sm, 1, 8).is_empty());
    }

    #[test]
    fn unlimited_per_plan_cap_uses_global_capacity() {
        let sm = machine(vec![job("aaa", &[]), job("bbb", &[]), job("ccc", &[])], Some(0));
        let selected = select_nodes(&sm, 6, 8);
        assert_eq!(selected.len(), 2);
    }
}
