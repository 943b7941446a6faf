//! Control-plane request handlers

use serde_json::{Value, json};

use crate::domain::{JobNodeSpec, PlanSpec, PlanStatus, slugify};
use crate::plan::{PlanStateMachine, ReshapeError, reshape};
use crate::runner::Runner;

use super::requests::ControlRequest;

fn ok(mut body: Value) -> Value {
    if let Some(object) = body.as_object_mut() {
        object.insert("success".to_string(), json!(true));
    }
    body
}

fn err(error: impl std::fmt::Display) -> Value {
    json!({"success": false, "error": error.to_string()})
}

/// Dispatch one validated request against the runner
pub async fn handle_request(runner: &Runner, request: ControlRequest) -> Value {
    match request {
        ControlRequest::CreatePlan(req) => {
            let start = req.start.unwrap_or(false);
            let spec = PlanSpec {
                name: req.name,
                base_branch: req.base_branch,
                target_branch: req.target_branch,
                max_parallel: req.max_parallel,
                clean_up_successful_work: req.clean_up_successful_work,
                auto_heal: req.auto_heal,
                verify_ri: req.verify_ri,
                jobs: req.jobs,
            };
            match runner.create_plan(&spec).await {
                Ok(plan_id) => {
                    if start && let Err(e) = runner.start(&plan_id).await {
                        return err(e);
                    }
                    ok(json!({"plan_id": plan_id}))
                }
                Err(e) => err(format!("{e:#}")),
            }
        }

        ControlRequest::CreateJob(req) => {
            let spec = PlanSpec {
                name: req.name.clone(),
                jobs: vec![JobNodeSpec {
                    producer_id: slugify(&req.name),
                    task: req.task,
                    name: Some(req.name),
                    work: req.work,
                    ..Default::default()
                }],
                ..Default::default()
            };
            match runner.create_plan(&spec).await {
                Ok(plan_id) => {
                    if req.start.unwrap_or(false)
                        && let Err(e) = runner.start(&plan_id).await
                    {
                        return err(e);
                    }
                    ok(json!({"plan_id": plan_id}))
                }
                Err(e) => err(format!("{e:#}")),
            }
        }

        ControlRequest::GetPlanStatus(req) => match runner.get_plan(&req.id).await {
            Some(plan) => {
                let machine = PlanStateMachine::new(plan);
                let counts: std::collections::HashMap<String, usize> = machine
                    .get_status_counts()
                    .into_iter()
                    .map(|(status, count)| (status.to_string(), count))
                    .collect();
                let plan = machine.plan();
                ok(json!({
                    "id": plan.id,
                    "name": plan.spec.name,
                    "status": machine.compute_plan_status(),
                    "node_counts": counts,
                    "started_at": plan.started_at,
                    "ended_at": machine.get_effective_ended_at(),
                    "state_version": plan.state_version,
                }))
            }
            None => err(format!("Unknown plan {}", req.id)),
        },

        ControlRequest::ListPlans(req) => {
            let filter = req.status.as_deref().and_then(PlanStatus::parse_filter);
            let plans: Vec<Value> = runner
                .list_plans(filter)
                .await
                .into_iter()
                .map(|(id, name, status, created_at)| {
                    json!({"id": id, "name": name, "status": status, "created_at": created_at})
                })
                .collect();
            ok(json!({"plans": plans}))
        }

        ControlRequest::CancelPlan(req) => match runner.cancel(&req.id).await {
            Ok(()) => ok(json!({})),
            Err(e) => err(format!("{e:#}")),
        },

        ControlRequest::DeletePlan(req) => match runner.delete_plan(&req.id).await {
            Ok(()) => ok(json!({})),
            Err(e) => err(format!("{e:#}")),
        },

        ControlRequest::RetryPlan(req) => match runner.retry_plan(&req.id).await {
            Ok(()) => ok(json!({})),
            Err(e) => err(format!("{e:#}")),
        },

        ControlRequest::GetNodeDetails(req) => {
            match runner.node_details(&req.plan_id, &req.node_id).await {
                Some((node, state)) => ok(json!({"node": node, "state": state})),
                None => err(format!("Unknown node {} in plan {}", req.node_id, req.plan_id)),
            }
        }

        ControlRequest::GetNodeLogs(req) => {
            let tail = req.tail.map(|n| n as usize);
            match runner.node_logs(&req.plan_id, &req.node_id, tail).await {
                Some(entries) => ok(json!({"entries": entries})),
                None => err(format!("Unknown node {} in plan {}", req.node_id, req.plan_id)),
            }
        }

        ControlRequest::GetNodeAttempts(req) => {
            match runner.node_details(&req.plan_id, &req.node_id).await {
                Some((_, state)) => ok(json!({
                    "attempts": state.attempts,
                    "history": state.attempt_history,
                })),
                None => err(format!("Unknown node {} in plan {}", req.node_id, req.plan_id)),
            }
        }

        ControlRequest::RetryPlanNode(req) => {
            match runner.retry_node(&req.plan_id, &req.node_id).await {
                Ok(()) => ok(json!({})),
                Err(e) => err(format!("{e:#}")),
            }
        }

        ControlRequest::GetNodeFailureContext(req) => {
            match runner.node_details(&req.plan_id, &req.node_id).await {
                Some((node, state)) => {
                    let logs = runner
                        .node_logs(&req.plan_id, &req.node_id, Some(50))
                        .await
                        .unwrap_or_default();
                    ok(json!({
                        "producer_id": node.producer_id,
                        "status": state.status,
                        "error": state.error,
                        "failure_reason": state.failure_reason,
                        "failed_phase": state.last_attempt.as_ref().and_then(|a| a.failed_phase),
                        "step_statuses": state.step_statuses,
                        "recent_logs": logs,
                    }))
                }
                None => err(format!("Unknown node {} in plan {}", req.node_id, req.plan_id)),
            }
        }

        ControlRequest::AddNode(req) => {
            let outcome = runner
                .reshape(&req.plan_id, |machine| {
                    let mut added = Vec::with_capacity(req.nodes.len());
                    for spec in &req.nodes {
                        added.push(reshape::add_node(machine, spec)?);
                    }
                    Ok(added)
                })
                .await;
            match outcome {
                Ok(node_ids) => ok(json!({"node_ids": node_ids})),
                Err(e) => err(e),
            }
        }

        ControlRequest::AddNodeBefore(req) => {
            let outcome = runner
                .reshape(&req.plan_id, |machine| {
                    let id = resolve(machine, &req.node_id)?;
                    reshape::add_node_before(machine, &id, &req.spec)
                })
                .await;
            match outcome {
                Ok(node_id) => ok(json!({"node_id": node_id})),
                Err(e) => err(e),
            }
        }

        ControlRequest::AddNodeAfter(req) => {
            let outcome = runner
                .reshape(&req.plan_id, |machine| {
                    let id = resolve(machine, &req.node_id)?;
                    reshape::add_node_after(machine, &id, &req.spec)
                })
                .await;
            match outcome {
                Ok(node_id) => ok(json!({"node_id": node_id})),
                Err(e) => err(e),
            }
        }

        ControlRequest::RemoveNode(req) => {
            let outcome = runner
                .reshape(&req.plan_id, |machine| {
                    let id = resolve(machine, &req.node_id)?;
                    reshape::remove_node(machine, &id)
                })
                .await;
            match outcome {
                Ok(()) => ok(json!({})),
                Err(e) => err(e),
            }
        }

        ControlRequest::UpdateNodeDependencies(req) => {
            let outcome = runner
                .reshape(&req.plan_id, |machine| {
                    let id = resolve(machine, &req.node_id)?;
                    reshape::update_node_dependencies(machine, &id, &req.dependencies)
                })
                .await;
            match outcome {
                Ok(()) => ok(json!({})),
                Err(e) => err(e),
            }
        }

        ControlRequest::ImportNodeSpec(req) => {
            let phase = req.phase.as_deref().unwrap_or("work");
            match runner
                .import_node_spec(
                    &req.plan_id,
                    &req.node_id,
                    phase,
                    std::path::Path::new(&req.path),
                )
                .await
            {
                Ok(()) => ok(json!({})),
                Err(e) => err(format!("{e:#}")),
            }
        }
    }
}

/// Accept either a producer id or an internal node id
fn resolve(machine: &PlanStateMachine, node_ref: &str) -> Result<String, ReshapeError> {
    let plan = machine.plan();
    if let Some(id) = plan.producer_id_to_node_id.get(node_ref) {
        return Ok(id.clone());
    }
    if plan.nodes.contains_key(node_ref) {
        return Ok(node_ref.to_string());
    }
    Err(ReshapeError(format!("Unknown node {node_ref}")))
}
