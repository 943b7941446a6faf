//! Snapshot persistence round-trips and tolerant reads

mod common;

use common::{create_test_repo, test_config};

use dagrun::domain::{JobNodeSpec, NodeStatus, PlanSpec, WorkSummary};
use dagrun::plan::{BuildOptions, PlanStateMachine, TransitionFields, build_plan};
use dagrun::store::PlanStore;

fn sample_plan() -> dagrun::domain::PlanInstance {
    let job = |producer_id: &str, deps: &[&str]| JobNodeSpec {
        producer_id: producer_id.to_string(),
        task: "do the thing".to_string(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        group: Some("batch/one".to_string()),
        ..Default::default()
    };
    let spec = PlanSpec {
        name: "persist me".to_string(),
        jobs: vec![job("first-node", &[]), job("second-node", &["first-node"])],
        ..Default::default()
    };
    build_plan(&spec, BuildOptions::default()).unwrap()
}

#[test]
fn save_load_round_trips_all_fields() {
    let dir = tempfile::tempdir().unwrap();
    let store = PlanStore::open(dir.path()).unwrap();

    // Exercise state so optional fields and maps are populated.
    let mut machine = PlanStateMachine::new(sample_plan());
    let first = machine.plan().node_id_of("first-node").unwrap().clone();
    machine.transition(&first, NodeStatus::Scheduled, Default::default());
    machine.transition(
        &first,
        NodeStatus::Running,
        TransitionFields {
            pid: Some(4242),
            base_commit: Some("abc123".to_string()),
            worktree_path: Some("/tmp/wt/node-first".into()),
            ..Default::default()
        },
    );
    machine.transition(
        &first,
        NodeStatus::Succeeded,
        TransitionFields {
            completed_commit: Some("def456".to_string()),
            work_summary: Some(WorkSummary {
                files_added: 2,
                files_modified: 1,
                files_deleted: 0,
                commit_count: 1,
            }),
            ..Default::default()
        },
    );
    let plan = machine.into_plan();

    store.save_plan(&plan).unwrap();
    let loaded = store.load_plan(&plan.id).expect("plan loads");

    assert_eq!(loaded, plan);
    // Reconstituted maps are real maps, keyed as before.
    assert_eq!(loaded.nodes.len(), 3);
    assert_eq!(loaded.producer_id_to_node_id["first-node"], first);
    assert_eq!(
        loaded.node_states[&first].completed_commit.as_deref(),
        Some("def456")
    );
    assert!(loaded.group_path_to_id.contains_key("batch/one"));
}

#[test]
fn corrupt_snapshot_yields_no_plan() {
    let dir = tempfile::tempdir().unwrap();
    let store = PlanStore::open(dir.path()).unwrap();
    let plan = sample_plan();
    store.save_plan(&plan).unwrap();

    std::fs::write(
        dir.path().join(&plan.id).join("plan.json"),
        "{\"definitely\": \"not a plan",
    )
    .unwrap();

    assert!(store.load_plan(&plan.id).is_none());
}

#[test]
fn corrupt_index_yields_empty_listing() {
    let dir = tempfile::tempdir().unwrap();
    let store = PlanStore::open(dir.path()).unwrap();
    store.save_plan(&sample_plan()).unwrap();

    std::fs::write(dir.path().join("plans-index.json"), "garbage").unwrap();
    assert!(store.list_plans().is_empty());
}

#[test]
fn delete_removes_snapshot_and_index_entry() {
    let dir = tempfile::tempdir().unwrap();
    let store = PlanStore::open(dir.path()).unwrap();
    let plan = sample_plan();
    store.save_plan(&plan).unwrap();
    assert_eq!(store.list_plans().len(), 1);

    store.delete_plan(&plan.id).unwrap();
    assert!(store.load_plan(&plan.id).is_none());
    assert!(store.list_plans().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runner_restores_persisted_plans() {
    let repo = create_test_repo();
    let plan_id;
    {
        let runner = dagrun::Runner::new(test_config(repo.path())).unwrap();
        runner.initialize().await.unwrap();
        let spec = PlanSpec {
            name: "survives restart".to_string(),
            jobs: vec![JobNodeSpec {
                producer_id: "patient-node".to_string(),
                task: "wait".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        plan_id = runner.create_plan(&spec).await.unwrap();
    }

    // A second runner over the same storage sees the plan.
    let runner = dagrun::Runner::new(test_config(repo.path())).unwrap();
    runner.initialize().await.unwrap();
    let plan = runner.get_plan(&plan_id).await.expect("plan restored");
    assert_eq!(plan.spec.name, "survives restart");
    assert!(plan.node_id_of("patient-node").is_some());
}
