//! Crash recovery for plans loaded from disk
//!
//! A node persisted as running whose process the OS no longer reports alive
//! becomes failed with a `crashed` reason; nodes with no recorded pid (or
//! stuck in scheduled) are treated the same.

use crate::domain::{FailureReason, NodeId, NodeStatus};
use crate::plan::{PlanStateMachine, TransitionFields};

/// Whether the OS reports a process as alive
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if ret == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Examine in-flight nodes after a restart. Returns true when anything
/// changed and the plan should be persisted.
pub fn recover_plan(machine: &mut PlanStateMachine) -> bool {
    let stale: Vec<(NodeId, Option<u32>)> = machine
        .plan()
        .node_states
        .iter()
        .filter(|(_, state)| {
            matches!(state.status, NodeStatus::Running | NodeStatus::Scheduled)
        })
        .map(|(id, state)| (id.clone(), state.pid))
        .collect();

    let mut changed = false;
    for (node_id, pid) in stale {
        if pid.is_some_and(pid_alive) {
            // The process is genuinely alive; leave it alone.
            continue;
        }
        let error = match pid {
            Some(pid) => format!("Process crashed (pid {pid} is no longer running)"),
            None => "Process crashed (no pid was recorded)".to_string(),
        };
        tracing::warn!("Recovering node {node_id}: {error}");
        let transitioned = machine.transition(
            &node_id,
            NodeStatus::Failed,
            TransitionFields {
                error: Some(error),
                failure_reason: Some(FailureReason::Crashed),
                ..Default::default()
            },
        );
        if transitioned
            && let Some(state) = machine.plan_mut().node_states.get_mut(&node_id)
        {
            state.pid = None;
        }
        changed |= transitioned;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobNodeSpec, PlanSpec, PlanStatus};
    use crate::plan::{BuildOptions, build_plan};

    fn machine_with_running_node(pid: Option<u32>) -> PlanStateMachine {
        let spec = PlanSpec {
            name: "recovery".to_string(),
            jobs: vec![JobNodeSpec {
                producer_id: "crashy".to_string(),
                task: "t".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut machine =
            PlanStateMachine::new(build_plan(&spec, BuildOptions::default()).unwrap());
        let id = machine.plan().node_id_of("crashy").unwrap().clone();
        machine.transition(&id, NodeStatus::Scheduled, Default::default());
        machine.transition(
            &id,
            NodeStatus::Running,
            TransitionFields {
                pid,
                ..Default::default()
            },
        );
        machine
    }

    #[test]
    fn dead_pid_becomes_failed_crashed() {
        // S5: a persisted running node whose pid is gone. Use an id far
        // above any plausible live process.
        let mut machine = machine_with_running_node(Some(i32::MAX as u32 - 7));
        assert!(recover_plan(&mut machine));

        let id = machine.plan().node_id_of("crashy").unwrap().clone();
        let state = machine.get_node_state(&id).unwrap();
        assert_eq!(state.status, NodeStatus::Failed);
        assert_eq!(state.failure_reason, Some(FailureReason::Crashed));
        assert!(state.error.as_deref().unwrap().contains("Process crashed"));
        assert_eq!(machine.compute_plan_status(), PlanStatus::Failed);
    }

    #[test]
    fn missing_pid_is_treated_as_crashed() {
        let mut machine = machine_with_running_node(None);
        assert!(recover_plan(&mut machine));

        let id = machine.plan().node_id_of("crashy").unwrap().clone();
        assert_eq!(
            machine.get_node_state(&id).unwrap().status,
            NodeStatus::Failed
        );
    }

    #[cfg(unix)]
    #[test]
    fn live_pid_is_left_running() {
        let own_pid = std::process::id();
        let mut machine = machine_with_running_node(Some(own_pid));
        assert!(!recover_plan(&mut machine));

        let id = machine.plan().node_id_of("crashy").unwrap().clone();
        assert_eq!(
            machine.get_node_state(&id).unwrap().status,
            NodeStatus::Running
        );
    }
}
