//! Structural edits on an already-started plan
//!
//! Every operation validates fully before touching the plan; a rejected edit
//! leaves the plan byte-for-byte unchanged.

use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

use crate::domain::{
    GroupExecutionState, GroupInstance, JobNode, JobNodeSpec, NodeExecutionState, NodeId,
    NodeStatus, PlanInstance,
};

use super::builder::{NodeBuildContext, build_nodes};
use super::{PlanStateMachine, ReshapeError};

/// Statuses in which a node's topology may be edited
fn is_modifiable_status(status: NodeStatus) -> bool {
    matches!(
        status,
        NodeStatus::Pending | NodeStatus::Ready | NodeStatus::Failed
    )
}

/// A dependency is available when its output can still be consumed
fn is_available_dependency(plan: &PlanInstance, node_id: &NodeId) -> Result<(), ReshapeError> {
    let node = plan
        .nodes
        .get(node_id)
        .ok_or_else(|| ReshapeError(format!("Unknown node {node_id}")))?;
    let state = plan
        .node_states
        .get(node_id)
        .ok_or_else(|| ReshapeError(format!("Unknown node {node_id}")))?;

    let available = match state.status {
        NodeStatus::Succeeded => {
            state.completed_commit.is_some() || !state.worktree_cleaned_up
        }
        NodeStatus::Running => state.worktree_path.is_some(),
        NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Canceled => false,
        _ => true,
    };
    if available {
        Ok(())
    } else {
        Err(ReshapeError(format!(
            "Dependency \"{}\" is no longer available (status {}, output reclaimed)",
            node.producer_id, state.status
        )))
    }
}

fn require_modifiable_plan(plan: &PlanInstance) -> Result<(), ReshapeError> {
    if plan.is_modifiable() {
        Ok(())
    } else {
        Err(ReshapeError("Plan has ended and can no longer be reshaped".to_string()))
    }
}

fn require_unique_producer_id(plan: &PlanInstance, producer_id: &str) -> Result<(), ReshapeError> {
    if plan.producer_id_to_node_id.contains_key(producer_id) {
        Err(ReshapeError(format!("Duplicate producer id \"{producer_id}\"")))
    } else {
        Ok(())
    }
}

/// BFS upward through `dependencies`, starting from `start`, looking for
/// `target`
fn reaches_upstream(plan: &PlanInstance, start: &[NodeId], target: &NodeId) -> bool {
    let mut queue: VecDeque<NodeId> = start.iter().cloned().collect();
    let mut seen: HashSet<NodeId> = queue.iter().cloned().collect();
    while let Some(id) = queue.pop_front() {
        if &id == target {
            return true;
        }
        if let Some(node) = plan.nodes.get(&id) {
            for dep in &node.dependencies {
                if seen.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                }
            }
        }
    }
    false
}

fn resolve_dependencies(
    plan: &PlanInstance,
    producer_ids: &[String],
) -> Result<Vec<NodeId>, ReshapeError> {
    let mut resolved = Vec::with_capacity(producer_ids.len());
    for pid in producer_ids {
        let id = plan
            .producer_id_to_node_id
            .get(pid)
            .ok_or_else(|| ReshapeError(format!("Unknown dependency \"{pid}\"")))?;
        is_available_dependency(plan, id)?;
        resolved.push(id.clone());
    }
    Ok(resolved)
}

/// Materialize a single spec into a node (shared builder path)
fn materialize(spec: &JobNodeSpec) -> Result<JobNode, ReshapeError> {
    let nodes = build_nodes(std::slice::from_ref(spec), &NodeBuildContext::default())
        .map_err(|e| ReshapeError(e.details.join("; ")))?;
    nodes
        .into_iter()
        .next()
        .ok_or_else(|| ReshapeError("Empty node spec".to_string()))
}

/// Status for a node whose dependency set just changed
fn recomputed_status(plan: &PlanInstance, dependencies: &[NodeId]) -> NodeStatus {
    let all_succeeded = dependencies.iter().all(|dep| {
        plan.node_states
            .get(dep)
            .is_some_and(|s| s.status == NodeStatus::Succeeded)
    });
    if all_succeeded {
        NodeStatus::Ready
    } else {
        NodeStatus::Pending
    }
}

fn apply_recomputed_status(plan: &mut PlanInstance, node_id: &NodeId) {
    let status = {
        let Some(node) = plan.nodes.get(node_id) else { return };
        recomputed_status(plan, &node.dependencies)
    };
    if let Some(state) = plan.node_states.get_mut(node_id) {
        state.status = status;
        state.error = None;
        state.failure_reason = None;
        state.ended_at = None;
        state.version += 1;
    }
}

fn recompute_roots_and_leaves(plan: &mut PlanInstance) {
    let mut roots: Vec<NodeId> = plan
        .nodes
        .values()
        .filter(|n| n.dependencies.is_empty())
        .map(|n| n.id.clone())
        .collect();
    roots.sort();
    let mut leaves: Vec<NodeId> = plan
        .nodes
        .values()
        .filter(|n| n.dependents.is_empty())
        .map(|n| n.id.clone())
        .collect();
    leaves.sort();
    plan.roots = roots;
    plan.leaves = leaves;
}

/// Re-derive the group hierarchy from the current node set, reusing ids for
/// paths that already exist so group state carries over.
fn resync_groups(plan: &mut PlanInstance) {
    let mut kept_paths: HashSet<String> = HashSet::new();

    let nodes: Vec<(NodeId, Option<String>)> = plan
        .nodes
        .values()
        .map(|n| (n.id.clone(), n.group.clone()))
        .collect();

    // Clear membership; rebuild below.
    for group in plan.groups.values_mut() {
        group.node_ids.clear();
        group.all_node_ids.clear();
        group.child_group_ids.clear();
        group.total_nodes = 0;
    }

    for (node_id, group_path) in &nodes {
        let Some(path) = group_path.as_deref().filter(|p| !p.trim().is_empty()) else {
            continue;
        };
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut parent_id: Option<String> = None;
        let mut current = String::new();

        for segment in &segments {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            kept_paths.insert(current.clone());

            let group_id = match plan.group_path_to_id.get(&current) {
                Some(id) => id.clone(),
                None => {
                    let id = Uuid::new_v4().to_string();
                    plan.groups.insert(
                        id.clone(),
                        GroupInstance {
                            id: id.clone(),
                            name: segment.to_string(),
                            path: current.clone(),
                            parent_group_id: parent_id.clone(),
                            child_group_ids: Vec::new(),
                            node_ids: Vec::new(),
                            all_node_ids: Vec::new(),
                            total_nodes: 0,
                        },
                    );
                    plan.group_states.insert(id.clone(), GroupExecutionState::new());
                    plan.group_path_to_id.insert(current.clone(), id.clone());
                    id
                }
            };

            if let Some(parent) = &parent_id
                && let Some(parent_group) = plan.groups.get_mut(parent)
                && !parent_group.child_group_ids.contains(&group_id)
            {
                parent_group.child_group_ids.push(group_id.clone());
            }
            parent_id = Some(group_id);
        }

        if let Some(leaf) = parent_id
            && let Some(group) = plan.groups.get_mut(&leaf)
        {
            group.node_ids.push(node_id.clone());
        }
    }

    // Drop groups whose path no longer has any member nodes beneath it.
    let stale: Vec<String> = plan
        .group_path_to_id
        .iter()
        .filter(|(path, _)| !kept_paths.contains(*path))
        .map(|(_, id)| id.clone())
        .collect();
    for id in stale {
        if let Some(group) = plan.groups.remove(&id) {
            plan.group_path_to_id.remove(&group.path);
            plan.group_states.remove(&id);
            if let Some(parent) = group.parent_group_id
                && let Some(parent_group) = plan.groups.get_mut(&parent)
            {
                parent_group.child_group_ids.retain(|c| c != &id);
            }
        }
    }

    // Transitive membership, deepest first.
    let mut paths: Vec<String> = plan.group_path_to_id.keys().cloned().collect();
    paths.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
    for path in paths {
        let id = plan.group_path_to_id[&path].clone();
        let (direct, children) = {
            let g = &plan.groups[&id];
            (g.node_ids.clone(), g.child_group_ids.clone())
        };
        let mut all = direct;
        for child in children {
            all.extend(plan.groups[&child].all_node_ids.iter().cloned());
        }
        let group = plan.groups.get_mut(&id).expect("group exists");
        group.total_nodes = all.len();
        group.all_node_ids = all;
    }
}

/// Wire a freshly added leaf into the snapshot-validation node so the plan
/// keeps a single terminal leaf, when the validation node can still accept
/// new dependencies.
fn wire_into_snapshot_validation(plan: &mut PlanInstance, node_id: &NodeId) {
    let Some(sv_id) = plan.snapshot_validation_node_id().cloned() else {
        return;
    };
    if &sv_id == node_id {
        return;
    }
    let sv_status = plan.node_states.get(&sv_id).map(|s| s.status);
    if !matches!(sv_status, Some(NodeStatus::Pending | NodeStatus::Ready)) {
        return;
    }
    // Never create a cycle through the validation node.
    if reaches_upstream(plan, std::slice::from_ref(node_id), &sv_id) {
        return;
    }
    let has_dependents = plan
        .nodes
        .get(node_id)
        .is_some_and(|n| !n.dependents.is_empty());
    if has_dependents {
        return;
    }

    if let Some(sv) = plan.nodes.get_mut(&sv_id)
        && !sv.dependencies.contains(node_id)
    {
        sv.dependencies.push(node_id.clone());
    }
    if let Some(node) = plan.nodes.get_mut(node_id) {
        node.dependents.push(sv_id.clone());
    }
    apply_recomputed_status(plan, &sv_id);
}

fn finish_edit(plan: &mut PlanInstance) {
    resync_groups(plan);
    recompute_roots_and_leaves(plan);
    plan.touch();
}

/// Add a new node to a started plan
pub fn add_node(
    machine: &mut PlanStateMachine,
    spec: &JobNodeSpec,
) -> Result<NodeId, ReshapeError> {
    let plan = machine.plan();
    require_modifiable_plan(plan)?;
    require_unique_producer_id(plan, spec.producer_id.trim())?;
    let node = materialize(spec)?;
    let dependencies = resolve_dependencies(plan, &spec.dependencies)?;

    let plan = machine.plan_mut();
    insert_node(plan, node, dependencies)
}

/// Add a new node that `existing` will depend on
pub fn add_node_before(
    machine: &mut PlanStateMachine,
    existing_id: &str,
    spec: &JobNodeSpec,
) -> Result<NodeId, ReshapeError> {
    let plan = machine.plan();
    require_modifiable_plan(plan)?;
    let existing = plan
        .nodes
        .get(existing_id)
        .ok_or_else(|| ReshapeError(format!("Unknown node {existing_id}")))?;
    let existing_status = plan.node_states[&existing.id].status;
    if !is_modifiable_status(existing_status) {
        return Err(ReshapeError(format!(
            "Node \"{}\" is {} and cannot take new dependencies",
            existing.producer_id, existing_status
        )));
    }
    require_unique_producer_id(plan, spec.producer_id.trim())?;
    let node = materialize(spec)?;
    let dependencies = resolve_dependencies(plan, &spec.dependencies)?;

    let existing_id = existing_id.to_string();
    let plan = machine.plan_mut();
    let new_id = node.id.clone();

    // Insert the node, then point the existing node at it.
    insert_node_raw(plan, node, dependencies);
    if let Some(existing) = plan.nodes.get_mut(&existing_id)
        && !existing.dependencies.contains(&new_id)
    {
        existing.dependencies.push(new_id.clone());
    }
    if let Some(new_node) = plan.nodes.get_mut(&new_id) {
        new_node.dependents.push(existing_id.clone());
    }
    apply_recomputed_status(plan, &new_id);
    apply_recomputed_status(plan, &existing_id);
    finish_edit(plan);
    Ok(new_id)
}

/// Splice a new node in after `existing`: the new node depends on
/// `existing` (plus any spec dependencies) and takes over `existing`'s
/// dependents, which are rewired to depend on the new node instead.
pub fn add_node_after(
    machine: &mut PlanStateMachine,
    existing_id: &str,
    spec: &JobNodeSpec,
) -> Result<NodeId, ReshapeError> {
    let plan = machine.plan();
    require_modifiable_plan(plan)?;
    let existing = plan
        .nodes
        .get(existing_id)
        .ok_or_else(|| ReshapeError(format!("Unknown node {existing_id}")))?;
    require_unique_producer_id(plan, spec.producer_id.trim())?;
    if spec.dependencies.iter().any(|d| d == spec.producer_id.trim()) {
        return Err(ReshapeError(format!(
            "Node \"{}\" cannot depend on itself",
            spec.producer_id
        )));
    }
    let node = materialize(spec)?;
    is_available_dependency(plan, &existing_id.to_string())?;
    let extra = resolve_dependencies(plan, &spec.dependencies)?;

    // The rewired dependents pick up a new dependency, so they must still
    // be editable.
    for dep_id in &existing.dependents {
        let status = plan.node_states[dep_id].status;
        if !is_modifiable_status(status) {
            let pid = &plan.nodes[dep_id].producer_id;
            return Err(ReshapeError(format!(
                "Dependent \"{pid}\" is {status} and cannot be rewired"
            )));
        }
    }
    // The new edge set must stay acyclic: a spec dependency that reaches one
    // of the rewired dependents would loop back through the new node.
    for dep_id in &existing.dependents {
        if reaches_upstream(plan, &extra, dep_id) {
            return Err(ReshapeError(format!(
                "Edit would create a dependency cycle through \"{}\"",
                spec.producer_id
            )));
        }
    }

    let mut dependencies = extra;
    if !dependencies.iter().any(|d| d == existing_id) {
        dependencies.insert(0, existing_id.to_string());
    }

    let existing_id = existing_id.to_string();
    let former_dependents = existing.dependents.clone();
    let plan = machine.plan_mut();
    let new_id = node.id.clone();
    insert_node_raw(plan, node, dependencies);

    // Splice: everything that depended on the existing node now depends on
    // the new node.
    for dep_id in &former_dependents {
        if let Some(dep_node) = plan.nodes.get_mut(dep_id) {
            for dep in dep_node.dependencies.iter_mut() {
                if dep == &existing_id {
                    *dep = new_id.clone();
                }
            }
        }
        if let Some(new_node) = plan.nodes.get_mut(&new_id)
            && !new_node.dependents.contains(dep_id)
        {
            new_node.dependents.push(dep_id.clone());
        }
        apply_recomputed_status(plan, dep_id);
    }
    if let Some(existing_node) = plan.nodes.get_mut(&existing_id) {
        existing_node.dependents.retain(|d| d == &new_id);
    }

    apply_recomputed_status(plan, &new_id);
    wire_into_snapshot_validation(plan, &new_id);
    finish_edit(plan);
    Ok(new_id)
}

fn insert_node_raw(plan: &mut PlanInstance, mut node: JobNode, dependencies: Vec<NodeId>) {
    node.dependencies = dependencies.clone();
    node.dependents = Vec::new();
    let node_id = node.id.clone();

    for dep in &dependencies {
        if let Some(dep_node) = plan.nodes.get_mut(dep)
            && !dep_node.dependents.contains(&node_id)
        {
            dep_node.dependents.push(node_id.clone());
        }
    }

    plan.producer_id_to_node_id
        .insert(node.producer_id.clone(), node_id.clone());
    let status = recomputed_status(plan, &dependencies);
    plan.node_states
        .insert(node_id.clone(), NodeExecutionState::new(status));
    plan.nodes.insert(node_id, node);
}

fn insert_node(
    plan: &mut PlanInstance,
    node: JobNode,
    dependencies: Vec<NodeId>,
) -> Result<NodeId, ReshapeError> {
    let node_id = node.id.clone();
    insert_node_raw(plan, node, dependencies);
    wire_into_snapshot_validation(plan, &node_id);
    finish_edit(plan);
    Ok(node_id)
}

/// Remove a node; every dependent must still be editable
pub fn remove_node(machine: &mut PlanStateMachine, node_id: &str) -> Result<(), ReshapeError> {
    let plan = machine.plan();
    require_modifiable_plan(plan)?;
    let node = plan
        .nodes
        .get(node_id)
        .ok_or_else(|| ReshapeError(format!("Unknown node {node_id}")))?;

    let own_status = plan.node_states[&node.id].status;
    if matches!(own_status, NodeStatus::Scheduled | NodeStatus::Running) {
        return Err(ReshapeError(format!(
            "Node \"{}\" is {} and cannot be removed",
            node.producer_id, own_status
        )));
    }
    for dep_id in &node.dependents {
        let status = plan.node_states[dep_id].status;
        if !is_modifiable_status(status) {
            let pid = &plan.nodes[dep_id].producer_id;
            return Err(ReshapeError(format!(
                "Dependent \"{pid}\" is {status} and cannot be rewired"
            )));
        }
    }

    let plan = machine.plan_mut();
    let node = plan.nodes.remove(node_id).expect("checked above");
    plan.node_states.remove(node_id);
    plan.producer_id_to_node_id.remove(&node.producer_id);

    for dep in &node.dependencies {
        if let Some(dep_node) = plan.nodes.get_mut(dep) {
            dep_node.dependents.retain(|d| d != node_id);
        }
        if let Some(dep_state) = plan.node_states.get_mut(dep) {
            dep_state.consumed_by_dependents.retain(|d| d != node_id);
        }
    }
    let dependents = node.dependents.clone();
    for dep_id in &dependents {
        if let Some(dep_node) = plan.nodes.get_mut(dep_id) {
            dep_node.dependencies.retain(|d| d != node_id);
        }
        apply_recomputed_status(plan, dep_id);
    }

    finish_edit(plan);
    Ok(())
}

/// Replace a node's dependency set
pub fn update_node_dependencies(
    machine: &mut PlanStateMachine,
    node_id: &str,
    new_deps: &[String],
) -> Result<(), ReshapeError> {
    let plan = machine.plan();
    require_modifiable_plan(plan)?;
    let node = plan
        .nodes
        .get(node_id)
        .ok_or_else(|| ReshapeError(format!("Unknown node {node_id}")))?;
    let status = plan.node_states[&node.id].status;
    if !is_modifiable_status(status) {
        return Err(ReshapeError(format!(
            "Node \"{}\" is {} and cannot be rewired",
            node.producer_id, status
        )));
    }
    if new_deps.iter().any(|d| d == &node.producer_id) {
        return Err(ReshapeError(format!(
            "Node \"{}\" cannot depend on itself",
            node.producer_id
        )));
    }
    let resolved = resolve_dependencies(plan, new_deps)?;
    if reaches_upstream(plan, &resolved, &node.id) {
        return Err(ReshapeError(format!(
            "Edit would create a dependency cycle through \"{}\"",
            node.producer_id
        )));
    }

    let node_key = node.id.clone();
    let old_deps = node.dependencies.clone();
    let plan = machine.plan_mut();

    for dep in &old_deps {
        if let Some(dep_node) = plan.nodes.get_mut(dep) {
            dep_node.dependents.retain(|d| d != &node_key);
        }
    }
    for dep in &resolved {
        if let Some(dep_node) = plan.nodes.get_mut(dep)
            && !dep_node.dependents.contains(&node_key)
        {
            dep_node.dependents.push(node_key.clone());
        }
    }
    if let Some(node) = plan.nodes.get_mut(&node_key) {
        node.dependencies = resolved;
    }
    apply_recomputed_status(plan, &node_key);
    finish_edit(plan);
    Ok(())
}
