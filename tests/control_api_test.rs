//! Control-plane request handling against a live runner

mod common;

use common::{create_test_repo, test_config};

use dagrun::Runner;
use dagrun::server::{handle_request, parse_request};
use serde_json::json;

async fn rpc(runner: &Runner, body: serde_json::Value) -> serde_json::Value {
    let request = parse_request(&body).expect("request parses");
    handle_request(runner, request).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_status_list_delete_flow() {
    let repo = create_test_repo();
    let runner = Runner::new(test_config(repo.path())).unwrap();
    runner.initialize().await.unwrap();

    let created = rpc(
        &runner,
        json!({
            "type": "create_plan",
            "name": "api plan",
            "jobs": [
                {"producer_id": "step-one", "task": "first"},
                {"producer_id": "step-two", "task": "second", "dependencies": ["step-one"]}
            ]
        }),
    )
    .await;
    assert_eq!(created["success"], json!(true));
    let plan_id = created["plan_id"].as_str().unwrap().to_string();

    let status = rpc(&runner, json!({"type": "get_plan_status", "id": plan_id})).await;
    assert_eq!(status["success"], json!(true));
    assert_eq!(status["status"], json!("pending"));
    // Two user jobs plus the injected validation node.
    assert_eq!(status["node_counts"]["pending"], json!(2));
    assert_eq!(status["node_counts"]["ready"], json!(1));

    let listed = rpc(&runner, json!({"type": "list_plans"})).await;
    assert_eq!(listed["plans"].as_array().unwrap().len(), 1);

    let filtered = rpc(&runner, json!({"type": "list_plans", "status": "running"})).await;
    assert!(filtered["plans"].as_array().unwrap().is_empty());

    let details = rpc(
        &runner,
        json!({"type": "get_node_details", "plan_id": plan_id, "node_id": "step-one"}),
    )
    .await;
    assert_eq!(details["success"], json!(true));
    assert_eq!(details["node"]["producer_id"], json!("step-one"));
    assert_eq!(details["state"]["status"], json!("ready"));

    let deleted = rpc(&runner, json!({"type": "delete_plan", "id": plan_id})).await;
    assert_eq!(deleted["success"], json!(true));
    let gone = rpc(&runner, json!({"type": "get_plan_status", "id": plan_id})).await;
    assert_eq!(gone["success"], json!(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn import_node_spec_reads_workspace_files_only() {
    let repo = create_test_repo();
    let runner = Runner::new(test_config(repo.path())).unwrap();
    runner.initialize().await.unwrap();

    let created = rpc(
        &runner,
        json!({
            "type": "create_plan",
            "name": "import flow",
            "jobs": [{"producer_id": "build-api", "task": "build"}]
        }),
    )
    .await;
    let plan_id = created["plan_id"].as_str().unwrap().to_string();

    std::fs::write(
        repo.path().join("build-spec.md"),
        "@agent implement the endpoint",
    )
    .unwrap();

    let imported = rpc(
        &runner,
        json!({
            "type": "import_node_spec",
            "plan_id": plan_id,
            "node_id": "build-api",
            "path": "build-spec.md"
        }),
    )
    .await;
    assert_eq!(imported["success"], json!(true), "{imported}");

    let plan = runner.get_plan(&plan_id).await.unwrap();
    let node = &plan.nodes[plan.node_id_of("build-api").unwrap()];
    match node.work.as_ref().expect("work spec imported") {
        dagrun::domain::WorkSpec::Agent { instructions, .. } => {
            assert_eq!(instructions, "implement the endpoint");
        }
        other => panic!("Expected agent spec, got {other:?}"),
    }
    // The imported spec also landed in the per-node spec files.
    let spec_file = test_config(repo.path())
        .storage_root()
        .join(&plan_id)
        .join("specs/build-api/current/work.json");
    assert!(spec_file.exists());

    // Paths escaping the workspace are rejected.
    let rejected = rpc(
        &runner,
        json!({
            "type": "import_node_spec",
            "plan_id": plan_id,
            "node_id": "build-api",
            "path": "../outside.md"
        }),
    )
    .await;
    assert_eq!(rejected["success"], json!(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reshape_requests_edit_the_plan() {
    let repo = create_test_repo();
    let runner = Runner::new(test_config(repo.path())).unwrap();
    runner.initialize().await.unwrap();

    let created = rpc(
        &runner,
        json!({
            "type": "create_plan",
            "name": "reshape me",
            "jobs": [{"producer_id": "base-node", "task": "t"}]
        }),
    )
    .await;
    let plan_id = created["plan_id"].as_str().unwrap().to_string();

    let added = rpc(
        &runner,
        json!({
            "type": "add_node",
            "plan_id": plan_id,
            "nodes": [{"producer_id": "extra-node", "task": "t", "dependencies": ["base-node"]}]
        }),
    )
    .await;
    assert_eq!(added["success"], json!(true), "{added}");

    let plan = runner.get_plan(&plan_id).await.unwrap();
    assert!(plan.node_id_of("extra-node").is_some());

    // A duplicate producer id is rejected and nothing changes.
    let version = plan.state_version;
    let rejected = rpc(
        &runner,
        json!({
            "type": "add_node",
            "plan_id": plan_id,
            "nodes": [{"producer_id": "extra-node", "task": "t"}]
        }),
    )
    .await;
    assert_eq!(rejected["success"], json!(false));
    assert!(rejected["error"].as_str().unwrap().contains("Duplicate"));
    assert_eq!(runner.get_plan(&plan_id).await.unwrap().state_version, version);

    let removed = rpc(
        &runner,
        json!({"type": "remove_node", "plan_id": plan_id, "node_id": "extra-node"}),
    )
    .await;
    assert_eq!(removed["success"], json!(true));
    assert!(
        runner
            .get_plan(&plan_id)
            .await
            .unwrap()
            .node_id_of("extra-node")
            .is_none()
    );
}
