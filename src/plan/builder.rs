//! Plan builder: compiles a user-authored spec into an immutable topology
//!
//! Validation rejects blank, duplicate, and unknown producer ids and any
//! dependency cycle. A terminal snapshot-validation node is always injected
//! so every plan has a single leaf that integrates and verifies the final
//! snapshot before the merge to the target branch.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use uuid::Uuid;

use crate::domain::{
    FINAL_MERGE_VALIDATION_GROUP, GroupExecutionState, GroupInstance, JobNode, JobNodeSpec,
    NodeExecutionState, NodeId, NodeStatus, PlanInstance, PlanSpec,
    SNAPSHOT_VALIDATION_NAME, SNAPSHOT_VALIDATION_PRODUCER_ID, WorkSpec, slugify,
};

use super::ValidationError;

/// Default per-plan concurrency cap when the spec does not supply one
pub const DEFAULT_MAX_PARALLEL: u32 = 4;

/// Options for [`build_plan`]
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub parent_plan_id: Option<String>,
    pub parent_node_id: Option<String>,
    pub repo_path: Option<PathBuf>,
    pub worktree_root: Option<PathBuf>,
}

/// Context for [`build_nodes`], shared with the reshaper
#[derive(Debug, Clone, Default)]
pub struct NodeBuildContext {
    /// Group path applied to nodes that do not declare one
    pub group: Option<String>,
}

/// Build a plan from a spec. Pure: no filesystem or git access.
pub fn build_plan(spec: &PlanSpec, opts: BuildOptions) -> Result<PlanInstance, ValidationError> {
    let mut nodes = build_nodes(&spec.jobs, &NodeBuildContext::default())?;

    // Resolve producer-id references into node ids.
    let mut producer_to_id: HashMap<String, NodeId> = HashMap::new();
    for node in &nodes {
        producer_to_id.insert(node.producer_id.clone(), node.id.clone());
    }

    let mut details = Vec::new();
    for node in &mut nodes {
        let mut resolved = Vec::with_capacity(node.dependencies.len());
        for dep in &node.dependencies {
            match producer_to_id.get(dep) {
                Some(id) => resolved.push(id.clone()),
                None => details.push(format!(
                    "Unknown dependency \"{}\" referenced by \"{}\"",
                    dep, node.producer_id
                )),
            }
        }
        node.dependencies = resolved;
    }
    if !details.is_empty() {
        return Err(ValidationError::new("Invalid plan spec", details));
    }

    // Cycle detection runs after id resolution; a self-edge is a cycle.
    if let Some(cycle) = find_cycle(&nodes) {
        let named: Vec<&str> = cycle.iter().map(String::as_str).collect();
        let detail = format!("Circular dependency detected: {}", named.join(" -> "));
        return Err(ValidationError::new("Invalid plan spec", vec![detail]));
    }

    // Inject the snapshot-validation node after all user nodes are
    // materialized and before roots/leaves are computed. It depends on every
    // original leaf and becomes the sole leaf.
    let verify_work = match &spec.verify_ri {
        Some(value) => Some(
            WorkSpec::parse(value)
                .map_err(|e| ValidationError::single(format!("Invalid verifyRi spec: {e}")))?,
        ),
        None => None,
    };
    let any_group = nodes.iter().any(|n| n.group.is_some());
    let sv = snapshot_validation_node(&nodes, verify_work, any_group);
    producer_to_id.insert(sv.producer_id.clone(), sv.id.clone());
    nodes.push(sv);

    // Reverse edges, in insertion order of the depending nodes.
    let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for node in &nodes {
        for dep in &node.dependencies {
            dependents.entry(dep.clone()).or_default().push(node.id.clone());
        }
    }
    for node in &mut nodes {
        node.dependents = dependents.remove(&node.id).unwrap_or_default();
    }

    let roots: Vec<NodeId> = nodes
        .iter()
        .filter(|n| n.dependencies.is_empty())
        .map(|n| n.id.clone())
        .collect();
    let leaves: Vec<NodeId> = nodes
        .iter()
        .filter(|n| n.dependents.is_empty())
        .map(|n| n.id.clone())
        .collect();

    // Seed statuses: roots start ready, everything else pending.
    let mut node_states = HashMap::new();
    for node in &nodes {
        let status = if node.dependencies.is_empty() {
            NodeStatus::Ready
        } else {
            NodeStatus::Pending
        };
        node_states.insert(node.id.clone(), NodeExecutionState::new(status));
    }

    let (groups, group_path_to_id) = synthesize_groups(&nodes);
    let group_states = groups
        .keys()
        .map(|id| (id.clone(), GroupExecutionState::new()))
        .collect();

    let base_branch = spec
        .base_branch
        .clone()
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| "main".to_string());
    let target_branch = spec
        .target_branch
        .clone()
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| base_branch.clone());

    let id = Uuid::new_v4().to_string();
    let repo_path = opts
        .repo_path
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let worktree_root = opts
        .worktree_root
        .unwrap_or_else(|| repo_path.join(".dagrun").join("worktrees").join(&id));

    let node_map: HashMap<NodeId, JobNode> =
        nodes.into_iter().map(|n| (n.id.clone(), n)).collect();

    Ok(PlanInstance {
        id,
        spec: spec.clone(),
        nodes: node_map,
        producer_id_to_node_id: producer_to_id,
        node_states,
        groups,
        group_states,
        group_path_to_id,
        roots,
        leaves,
        repo_path,
        base_branch,
        target_branch,
        worktree_root,
        created_at: chrono::Utc::now(),
        started_at: None,
        ended_at: None,
        state_version: 1,
        clean_up_successful_work: spec.clean_up_successful_work.unwrap_or(true),
        max_parallel: spec.max_parallel.unwrap_or(DEFAULT_MAX_PARALLEL),
        is_paused: false,
        parent_plan_id: opts.parent_plan_id,
        parent_node_id: opts.parent_node_id,
    })
}

/// Build a one-job plan; the job name is slugified into its producer id.
pub fn build_single_job_plan(
    name: &str,
    task: &str,
    work: Option<serde_json::Value>,
    opts: BuildOptions,
) -> Result<PlanInstance, ValidationError> {
    let producer_id = slugify(name);
    let spec = PlanSpec {
        name: name.to_string(),
        jobs: vec![JobNodeSpec {
            producer_id,
            task: task.to_string(),
            name: Some(name.to_string()),
            work,
            ..Default::default()
        }],
        ..Default::default()
    };
    build_plan(&spec, opts)
}

/// Materialize job specs into nodes. Shared by the builder and the reshaper.
///
/// Dependencies are left as producer ids; the caller resolves them. The
/// returned nodes have empty `dependents`.
pub fn build_nodes(
    specs: &[JobNodeSpec],
    ctx: &NodeBuildContext,
) -> Result<Vec<JobNode>, ValidationError> {
    let mut details = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut duplicates: HashSet<&str> = HashSet::new();

    for (index, spec) in specs.iter().enumerate() {
        let pid = spec.producer_id.trim();
        if pid.is_empty() {
            details.push(format!("Job at index {} has a missing or blank producer id", index));
            continue;
        }
        if !seen.insert(pid) && duplicates.insert(pid) {
            details.push(format!("Duplicate producer id \"{}\"", pid));
        }
        if spec.sub_plan.is_some() {
            details.push(format!(
                "Job \"{}\" uses the unsupported subPlan node kind",
                pid
            ));
        }
    }

    let mut nodes = Vec::with_capacity(specs.len());
    for spec in specs {
        let work = parse_phase_spec(&spec.work, &spec.producer_id, "work", &mut details);
        let prechecks =
            parse_phase_spec(&spec.prechecks, &spec.producer_id, "prechecks", &mut details);
        let postchecks =
            parse_phase_spec(&spec.postchecks, &spec.producer_id, "postchecks", &mut details);

        nodes.push(JobNode {
            id: Uuid::new_v4().to_string(),
            producer_id: spec.producer_id.trim().to_string(),
            name: spec
                .name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| spec.producer_id.trim().to_string()),
            task: spec.task.clone(),
            work,
            prechecks,
            postchecks,
            instructions: spec.instructions.clone(),
            base_branch: spec.base_branch.clone(),
            group: spec.group.clone().or_else(|| ctx.group.clone()),
            expects_no_changes: spec.expects_no_changes.unwrap_or(false),
            auto_heal: spec.auto_heal.unwrap_or(false),
            dependencies: spec.dependencies.clone(),
            dependents: Vec::new(),
        });
    }

    if !details.is_empty() {
        return Err(ValidationError::new("Invalid plan spec", details));
    }
    Ok(nodes)
}

fn parse_phase_spec(
    value: &Option<serde_json::Value>,
    producer_id: &str,
    phase: &str,
    details: &mut Vec<String>,
) -> Option<WorkSpec> {
    match value {
        None => None,
        Some(v) => match WorkSpec::parse(v) {
            Ok(spec) => Some(spec),
            Err(e) => {
                details.push(format!("Job \"{}\" has an invalid {} spec: {}", producer_id, phase, e));
                None
            }
        },
    }
}

fn snapshot_validation_node(nodes: &[JobNode], work: Option<WorkSpec>, any_group: bool) -> JobNode {
    // Original leaves: nodes no other node depends on.
    let depended_on: HashSet<&NodeId> =
        nodes.iter().flat_map(|n| n.dependencies.iter()).collect();
    let leaf_ids: Vec<NodeId> = nodes
        .iter()
        .filter(|n| !depended_on.contains(&n.id))
        .map(|n| n.id.clone())
        .collect();

    JobNode {
        id: Uuid::new_v4().to_string(),
        producer_id: SNAPSHOT_VALIDATION_PRODUCER_ID.to_string(),
        name: SNAPSHOT_VALIDATION_NAME.to_string(),
        task: "Rebase the integrated snapshot onto the target branch head and run final verification".to_string(),
        work,
        prechecks: None,
        postchecks: None,
        instructions: None,
        base_branch: None,
        group: any_group.then(|| FINAL_MERGE_VALIDATION_GROUP.to_string()),
        expects_no_changes: false,
        auto_heal: false,
        dependencies: leaf_ids,
        dependents: Vec::new(),
    }
}

/// Find a dependency cycle, returning the producer ids along it.
fn find_cycle(nodes: &[JobNode]) -> Option<Vec<String>> {
    let by_id: HashMap<&NodeId, &JobNode> = nodes.iter().map(|n| (&n.id, n)).collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    let mut marks: HashMap<&NodeId, Mark> = HashMap::new();
    let mut stack: Vec<&NodeId> = Vec::new();

    fn visit<'a>(
        id: &'a NodeId,
        by_id: &HashMap<&'a NodeId, &'a JobNode>,
        marks: &mut HashMap<&'a NodeId, Mark>,
        stack: &mut Vec<&'a NodeId>,
    ) -> Option<Vec<String>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                // Close the loop from the first occurrence on the stack.
                let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..]
                    .iter()
                    .filter_map(|s| by_id.get(*s).map(|n| n.producer_id.clone()))
                    .collect();
                if let Some(node) = by_id.get(id) {
                    cycle.push(node.producer_id.clone());
                }
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(id, Mark::InProgress);
        stack.push(id);
        if let Some(node) = by_id.get(id).copied() {
            for dep in &node.dependencies {
                if let Some(cycle) = visit(dep, by_id, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    for node in nodes {
        if let Some(cycle) = visit(&node.id, &by_id, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

/// Materialize every level of each node's group path and link the hierarchy.
fn synthesize_groups(
    nodes: &[JobNode],
) -> (HashMap<String, GroupInstance>, HashMap<String, String>) {
    let mut groups: HashMap<String, GroupInstance> = HashMap::new();
    let mut path_to_id: HashMap<String, String> = HashMap::new();

    for node in nodes {
        let Some(path) = node.group.as_deref().filter(|p| !p.trim().is_empty()) else {
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

            let group_id = match path_to_id.get(&current) {
                Some(id) => id.clone(),
                None => {
                    let id = Uuid::new_v4().to_string();
                    groups.insert(
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
                    path_to_id.insert(current.clone(), id.clone());
                    id
                }
            };

            if let Some(parent) = &parent_id {
                let parent_group = groups.get_mut(parent).expect("parent group exists");
                if !parent_group.child_group_ids.contains(&group_id) {
                    parent_group.child_group_ids.push(group_id.clone());
                }
            }
            parent_id = Some(group_id);
        }

        // Direct membership lands on the deepest level.
        if let Some(leaf_group) = parent_id
            && let Some(group) = groups.get_mut(&leaf_group)
        {
            group.node_ids.push(node.id.clone());
        }
    }

    // Transitive membership, deepest paths first so children aggregate before
    // their parents.
    let mut paths: Vec<String> = path_to_id.keys().cloned().collect();
    paths.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
    for path in paths {
        let id = path_to_id[&path].clone();
        let (direct, children) = {
            let g = &groups[&id];
            (g.node_ids.clone(), g.child_group_ids.clone())
        };
        let mut all = direct;
        for child in children {
            all.extend(groups[&child].all_node_ids.iter().cloned());
        }
        all.dedup();
        let group = groups.get_mut(&id).expect("group exists");
        group.total_nodes = all.len();
        group.all_node_ids = all;
    }

    (groups, path_to_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobNodeSpec;

    fn job(producer_id: &str, deps: &[&str]) -> JobNodeSpec {
        JobNodeSpec {
            producer_id: producer_id.to_string(),
            task: "t".to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    fn spec(jobs: Vec<JobNodeSpec>) -> PlanSpec {
        PlanSpec {
            name: "test plan".to_string(),
            jobs,
            ..Default::default()
        }
    }

    #[test]
    fn single_job_plan_has_injected_leaf() {
        let plan = build_plan(&spec(vec![job("build", &[])]), BuildOptions::default()).unwrap();

        assert_eq!(plan.nodes.len(), 2);
        let build_id = plan.node_id_of("build").unwrap().clone();
        let sv_id = plan.snapshot_validation_node_id().unwrap().clone();
        assert_eq!(plan.roots, vec![build_id.clone()]);
        assert_eq!(plan.leaves, vec![sv_id.clone()]);

        let sv = &plan.nodes[&sv_id];
        assert_eq!(sv.dependencies, vec![build_id.clone()]);
        assert_eq!(sv.name, SNAPSHOT_VALIDATION_NAME);

        assert_eq!(plan.node_states[&build_id].status, NodeStatus::Ready);
        assert_eq!(plan.node_states[&sv_id].status, NodeStatus::Pending);
    }

    #[test]
    fn cycle_is_rejected_with_names() {
        let err = build_plan(
            &spec(vec![job("x", &["y"]), job("y", &["x"])]),
            BuildOptions::default(),
        )
        .unwrap_err();

        let joined = err.details.join("\n");
        assert!(joined.contains("Circular"), "details: {joined}");
        assert!(joined.contains("x") && joined.contains("y"), "details: {joined}");
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let err =
            build_plan(&spec(vec![job("solo", &["solo"])]), BuildOptions::default()).unwrap_err();
        assert!(err.details.iter().any(|d| d.contains("Circular")));
    }

    #[test]
    fn duplicate_producer_ids_reported_once_each() {
        let err = build_plan(
            &spec(vec![job("dup", &[]), job("dup", &[]), job("dup", &[])]),
            BuildOptions::default(),
        )
        .unwrap_err();

        let matches = err
            .details
            .iter()
            .filter(|d| d.contains("Duplicate") && d.contains("\"dup\""))
            .count();
        assert_eq!(matches, 1);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = build_plan(&spec(vec![job("a", &["ghost"])]), BuildOptions::default())
            .unwrap_err();
        assert!(err.details.iter().any(|d| d.contains("\"ghost\"")));
    }

    #[test]
    fn blank_producer_id_is_rejected() {
        let err = build_plan(
            &spec(vec![job("", &[]), job("ok-node", &[])]),
            BuildOptions::default(),
        )
        .unwrap_err();
        assert!(err.details.iter().any(|d| d.contains("blank")));
    }

    #[test]
    fn sub_plan_nodes_are_rejected() {
        let mut j = job("legacy", &[]);
        j.sub_plan = Some(serde_json::json!({"jobs": []}));
        let err = build_plan(&spec(vec![j]), BuildOptions::default()).unwrap_err();
        assert!(err.details.iter().any(|d| d.contains("subPlan")));
    }

    #[test]
    fn dependents_are_reverse_edges_in_insertion_order() {
        let plan = build_plan(
            &spec(vec![job("a", &[]), job("b", &["a"]), job("c", &["a"])]),
            BuildOptions::default(),
        )
        .unwrap();

        let a = plan.node_id_of("a").unwrap();
        let b = plan.node_id_of("b").unwrap().clone();
        let c = plan.node_id_of("c").unwrap().clone();
        assert_eq!(plan.nodes[a].dependents, vec![b, c]);
    }

    #[test]
    fn group_paths_materialize_every_level() {
        let mut j1 = job("one-node", &[]);
        j1.group = Some("backend/api/v2".to_string());
        let mut j2 = job("two-node", &[]);
        j2.group = Some("backend".to_string());

        let plan = build_plan(&spec(vec![j1, j2]), BuildOptions::default()).unwrap();

        for path in ["backend", "backend/api", "backend/api/v2"] {
            assert!(plan.group_path_to_id.contains_key(path), "missing group {path}");
        }
        // Snapshot validation joins its own group because the plan declares groups.
        assert!(plan.group_path_to_id.contains_key(FINAL_MERGE_VALIDATION_GROUP));

        let backend = &plan.groups[&plan.group_path_to_id["backend"]];
        assert_eq!(backend.child_group_ids.len(), 1);
        assert_eq!(backend.total_nodes, 2);

        let v2 = &plan.groups[&plan.group_path_to_id["backend/api/v2"]];
        assert_eq!(v2.node_ids.len(), 1);
        assert_eq!(v2.total_nodes, 1);
    }

    #[test]
    fn snapshot_validation_gets_verify_work() {
        let mut s = spec(vec![job("build", &[])]);
        s.verify_ri = Some(serde_json::json!("cargo test --all"));
        let plan = build_plan(&s, BuildOptions::default()).unwrap();
        let sv = &plan.nodes[plan.snapshot_validation_node_id().unwrap()];
        assert_eq!(sv.work, Some(WorkSpec::shell("cargo test --all")));
    }

    #[test]
    fn defaults_are_applied() {
        let plan = build_plan(&spec(vec![job("build", &[])]), BuildOptions::default()).unwrap();
        assert_eq!(plan.base_branch, "main");
        assert_eq!(plan.target_branch, "main");
        assert_eq!(plan.max_parallel, DEFAULT_MAX_PARALLEL);
        assert!(plan.clean_up_successful_work);
    }

    #[test]
    fn single_job_plan_slugifies_name() {
        let plan =
            build_single_job_plan("Fix the API!", "fix it", None, BuildOptions::default()).unwrap();
        assert!(plan.node_id_of("fix-the-api").is_some());
    }
}
