//! End-to-end runner tests against real git repositories

mod common;

use common::{branch_exists, create_test_repo, show_file, test_config};

use dagrun::Runner;
use dagrun::domain::{JobNodeSpec, NodeStatus, PlanSpec, PlanStatus};

fn shell_job(producer_id: &str, deps: &[&str], command: &str) -> JobNodeSpec {
    JobNodeSpec {
        producer_id: producer_id.to_string(),
        task: format!("run {producer_id}"),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        work: Some(serde_json::json!(command)),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_job_happy_path() {
    // S1: one job plus the injected validation leaf; everything succeeds
    // and the snapshot lands on a derived branch.
    let repo = create_test_repo();
    let runner = Runner::new(test_config(repo.path())).unwrap();
    runner.initialize().await.unwrap();

    let spec = PlanSpec {
        name: "happy path".to_string(),
        jobs: vec![shell_job("build", &[], "echo built > out.txt")],
        ..Default::default()
    };
    let plan_id = runner.create_plan(&spec).await.unwrap();

    {
        let plan = runner.get_plan(&plan_id).await.unwrap();
        assert_eq!(plan.nodes.len(), 2);
        assert_eq!(plan.roots.len(), 1);
        assert_eq!(plan.leaves.len(), 1);
        assert_eq!(plan.leaves[0], *plan.snapshot_validation_node_id().unwrap());
    }

    runner.start(&plan_id).await.unwrap();
    let status = runner.wait_for_plan(&plan_id).await.unwrap();
    assert_eq!(status, PlanStatus::Succeeded);

    let plan = runner.get_plan(&plan_id).await.unwrap();
    assert!(plan.ended_at.is_some());
    for state in plan.node_states.values() {
        assert_eq!(state.status, NodeStatus::Succeeded);
    }

    let build_id = plan.node_id_of("build").unwrap();
    let build_state = &plan.node_states[build_id];
    assert!(build_state.completed_commit.is_some());
    let summary = build_state.work_summary.as_ref().unwrap();
    assert_eq!(summary.files_added, 1);
    assert_eq!(summary.commit_count, 1);

    // main is the default branch, so the merge goes to a derived branch.
    assert!(branch_exists(repo.path(), "dagrun/happy-path"));
    assert_eq!(
        show_file(repo.path(), "dagrun/happy-path", "out.txt").as_deref(),
        Some("built\n")
    );

    // Consumption closed, so worktrees were reclaimed.
    for state in plan.node_states.values() {
        assert!(state.worktree_cleaned_up, "worktree should be reclaimed");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn diamond_merges_all_outputs_forward() {
    // S6 shape end-to-end: a -> {b, c} -> d; every node's file reaches the
    // target branch, and a's worktree is reclaimed once b and c consumed it.
    let repo = create_test_repo();
    let runner = Runner::new(test_config(repo.path())).unwrap();
    runner.initialize().await.unwrap();

    let spec = PlanSpec {
        name: "diamond flow".to_string(),
        jobs: vec![
            shell_job("aaa", &[], "echo a > a.txt"),
            shell_job("bbb", &["aaa"], "echo b > b.txt"),
            shell_job("ccc", &["aaa"], "echo c > c.txt"),
            shell_job("ddd", &["bbb", "ccc"], "echo d > d.txt"),
        ],
        ..Default::default()
    };
    let plan_id = runner.create_plan(&spec).await.unwrap();
    runner.start(&plan_id).await.unwrap();
    let status = runner.wait_for_plan(&plan_id).await.unwrap();
    assert_eq!(status, PlanStatus::Succeeded);

    let plan = runner.get_plan(&plan_id).await.unwrap();
    let a = plan.node_id_of("aaa").unwrap().clone();
    let b = plan.node_id_of("bbb").unwrap().clone();
    let c = plan.node_id_of("ccc").unwrap().clone();

    // Consumption acknowledgments from both direct dependents.
    let consumed = &plan.node_states[&a].consumed_by_dependents;
    assert!(consumed.contains(&b) && consumed.contains(&c), "{consumed:?}");
    assert!(plan.node_states[&a].worktree_cleaned_up);

    for file in ["a.txt", "b.txt", "c.txt", "d.txt"] {
        assert!(
            show_file(repo.path(), "dagrun/diamond-flow", file).is_some(),
            "{file} missing from target branch"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_node_blocks_downstream() {
    // S2 through the runner: a failing root blocks its chain and the plan
    // ends failed.
    let repo = create_test_repo();
    let runner = Runner::new(test_config(repo.path())).unwrap();
    runner.initialize().await.unwrap();

    let spec = PlanSpec {
        name: "fail cascade".to_string(),
        jobs: vec![
            shell_job("aaa", &[], "exit 3"),
            shell_job("bbb", &["aaa"], "echo never > b.txt"),
        ],
        ..Default::default()
    };
    let plan_id = runner.create_plan(&spec).await.unwrap();
    runner.start(&plan_id).await.unwrap();
    let status = runner.wait_for_plan(&plan_id).await.unwrap();
    assert_eq!(status, PlanStatus::Failed);

    let plan = runner.get_plan(&plan_id).await.unwrap();
    let a = plan.node_id_of("aaa").unwrap();
    let b = plan.node_id_of("bbb").unwrap();

    let a_state = &plan.node_states[a];
    assert_eq!(a_state.status, NodeStatus::Failed);
    assert!(a_state.error.as_deref().unwrap().contains("status 3"));
    assert_eq!(a_state.attempt_history.len(), 1);
    assert_eq!(a_state.attempt_history[0].exit_code, Some(3));

    assert_eq!(plan.node_states[b].status, NodeStatus::Blocked);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expects_no_changes_fails_on_dirty_tree() {
    let repo = create_test_repo();
    let runner = Runner::new(test_config(repo.path())).unwrap();
    runner.initialize().await.unwrap();

    let mut check = shell_job("check-only", &[], "echo dirty > leak.txt");
    check.expects_no_changes = Some(true);
    let spec = PlanSpec {
        name: "validation only".to_string(),
        jobs: vec![check],
        ..Default::default()
    };
    let plan_id = runner.create_plan(&spec).await.unwrap();
    runner.start(&plan_id).await.unwrap();
    let status = runner.wait_for_plan(&plan_id).await.unwrap();
    assert_eq!(status, PlanStatus::Failed);

    let plan = runner.get_plan(&plan_id).await.unwrap();
    let node = plan.node_id_of("check-only").unwrap();
    let state = &plan.node_states[node];
    assert_eq!(state.status, NodeStatus::Failed);
    assert!(state.error.as_deref().unwrap().contains("expected no changes"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_after_failure_recovers_the_plan() {
    // S3 through the runner: fix the cause, retry the node, plan completes.
    let repo = create_test_repo();
    let runner = Runner::new(test_config(repo.path())).unwrap();
    runner.initialize().await.unwrap();

    let marker = repo.path().join("fixed.marker");
    let command = format!(
        "test -f {} && echo ok > done.txt",
        marker.display()
    );
    let spec = PlanSpec {
        name: "retry flow".to_string(),
        jobs: vec![shell_job("flaky", &[], &command)],
        ..Default::default()
    };
    let plan_id = runner.create_plan(&spec).await.unwrap();
    runner.start(&plan_id).await.unwrap();
    assert_eq!(
        runner.wait_for_plan(&plan_id).await.unwrap(),
        PlanStatus::Failed
    );

    std::fs::write(&marker, "ready").unwrap();
    runner.retry_node(&plan_id, "flaky").await.unwrap();
    let status = runner.wait_for_plan(&plan_id).await.unwrap();
    assert_eq!(status, PlanStatus::Succeeded);

    let plan = runner.get_plan(&plan_id).await.unwrap();
    let state = &plan.node_states[plan.node_id_of("flaky").unwrap()];
    assert_eq!(state.attempts, 2);
    assert_eq!(state.attempt_history.len(), 2);
}
