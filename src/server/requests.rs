//! Validated control-plane requests
//!
//! Every request is a tagged JSON object (`{"type": "create_plan", ...}`).
//! Unknown request kinds, unknown fields, and out-of-range values are
//! rejected before the core ever sees the record.

use serde::Deserialize;
use serde_json::Value;

use crate::domain::{JobNodeSpec, PRODUCER_ID_RE, PlanStatus};

/// Limits enforced by the schema layer
const MAX_NAME_LEN: usize = 256;
const MAX_PLAN_PARALLEL: u32 = 32;
const MAX_DEPENDENCIES: usize = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreatePlanRequest {
    pub name: String,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub clean_up_successful_work: Option<bool>,
    #[serde(default)]
    pub auto_heal: Option<bool>,
    #[serde(default)]
    pub verify_ri: Option<Value>,
    pub jobs: Vec<JobNodeSpec>,
    /// Start running immediately after creation
    #[serde(default)]
    pub start: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateJobRequest {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub work: Option<Value>,
    #[serde(default)]
    pub start: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanIdRequest {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListPlansRequest {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeRefRequest {
    pub plan_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeLogsRequest {
    pub plan_id: String,
    pub node_id: String,
    #[serde(default)]
    pub tail: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddNodesRequest {
    pub plan_id: String,
    pub nodes: Vec<JobNodeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddNodeEdgeRequest {
    pub plan_id: String,
    pub node_id: String,
    pub spec: JobNodeSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateDepsRequest {
    pub plan_id: String,
    pub node_id: String,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportNodeSpecRequest {
    pub plan_id: String,
    pub node_id: String,
    /// `work` (default), `prechecks`, or `postchecks`
    #[serde(default)]
    pub phase: Option<String>,
    /// File inside the workspace to read the spec from
    pub path: String,
}

/// Every request the control plane accepts
#[derive(Debug, Clone)]
pub enum ControlRequest {
    CreatePlan(CreatePlanRequest),
    CreateJob(CreateJobRequest),
    GetPlanStatus(PlanIdRequest),
    ListPlans(ListPlansRequest),
    CancelPlan(PlanIdRequest),
    DeletePlan(PlanIdRequest),
    RetryPlan(PlanIdRequest),
    GetNodeDetails(NodeRefRequest),
    GetNodeLogs(NodeLogsRequest),
    GetNodeAttempts(NodeRefRequest),
    RetryPlanNode(NodeRefRequest),
    GetNodeFailureContext(NodeRefRequest),
    AddNode(AddNodesRequest),
    AddNodeBefore(AddNodeEdgeRequest),
    AddNodeAfter(AddNodeEdgeRequest),
    RemoveNode(NodeRefRequest),
    UpdateNodeDependencies(UpdateDepsRequest),
    ImportNodeSpec(ImportNodeSpecRequest),
}

/// Parse and validate one request body
pub fn parse_request(body: &Value) -> Result<ControlRequest, String> {
    let Some(object) = body.as_object() else {
        return Err("Request body must be a JSON object".to_string());
    };
    let Some(kind) = object.get("type").and_then(|t| t.as_str()) else {
        return Err("Request is missing the \"type\" field".to_string());
    };

    let mut payload = object.clone();
    payload.remove("type");
    let payload = Value::Object(payload);

    fn from<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, String> {
        serde_json::from_value(payload).map_err(|e| format!("Invalid request: {e}"))
    }

    let request = match kind {
        "create_plan" => ControlRequest::CreatePlan(from(payload)?),
        "create_job" => ControlRequest::CreateJob(from(payload)?),
        "get_plan_status" => ControlRequest::GetPlanStatus(from(payload)?),
        "list_plans" => ControlRequest::ListPlans(from(payload)?),
        "cancel_plan" => ControlRequest::CancelPlan(from(payload)?),
        "delete_plan" => ControlRequest::DeletePlan(from(payload)?),
        "retry_plan" => ControlRequest::RetryPlan(from(payload)?),
        "get_node_details" => ControlRequest::GetNodeDetails(from(payload)?),
        "get_node_logs" => ControlRequest::GetNodeLogs(from(payload)?),
        "get_node_attempts" => ControlRequest::GetNodeAttempts(from(payload)?),
        "retry_plan_node" => ControlRequest::RetryPlanNode(from(payload)?),
        "get_node_failure_context" => ControlRequest::GetNodeFailureContext(from(payload)?),
        "add_node" => ControlRequest::AddNode(from(payload)?),
        "add_node_before" => ControlRequest::AddNodeBefore(from(payload)?),
        "add_node_after" => ControlRequest::AddNodeAfter(from(payload)?),
        "remove_node" => ControlRequest::RemoveNode(from(payload)?),
        "update_node_dependencies" => ControlRequest::UpdateNodeDependencies(from(payload)?),
        "import_node_spec" => ControlRequest::ImportNodeSpec(from(payload)?),
        other => return Err(format!("Unknown request type \"{other}\"")),
    };

    validate(&request)?;
    Ok(request)
}

fn validate(request: &ControlRequest) -> Result<(), String> {
    match request {
        ControlRequest::CreatePlan(req) => {
            let mut errors = Vec::new();
            if req.name.is_empty() || req.name.len() > MAX_NAME_LEN {
                errors.push(format!("name must be 1..={MAX_NAME_LEN} characters"));
            }
            if let Some(parallel) = req.max_parallel
                && !(1..=MAX_PLAN_PARALLEL).contains(&parallel)
            {
                errors.push(format!("max_parallel must be 1..={MAX_PLAN_PARALLEL}"));
            }
            if req.jobs.is_empty() {
                errors.push("jobs must contain at least one entry".to_string());
            }
            for job in &req.jobs {
                errors.extend(validate_job_spec(job));
            }
            reject_if(errors)
        }
        ControlRequest::CreateJob(req) => {
            let mut errors = Vec::new();
            if req.name.is_empty() || req.name.len() > MAX_NAME_LEN {
                errors.push(format!("name must be 1..={MAX_NAME_LEN} characters"));
            }
            if req.task.trim().is_empty() {
                errors.push("task must not be blank".to_string());
            }
            reject_if(errors)
        }
        ControlRequest::ListPlans(req) => {
            if let Some(status) = &req.status
                && PlanStatus::parse_filter(status).is_none()
            {
                return Err(format!("Unknown status filter \"{status}\""));
            }
            Ok(())
        }
        ControlRequest::AddNode(req) => {
            let mut errors = Vec::new();
            if req.nodes.is_empty() {
                errors.push("nodes must contain at least one entry".to_string());
            }
            for node in &req.nodes {
                errors.extend(validate_job_spec(node));
            }
            reject_if(errors)
        }
        ControlRequest::AddNodeBefore(req) | ControlRequest::AddNodeAfter(req) => {
            reject_if(validate_job_spec(&req.spec))
        }
        ControlRequest::ImportNodeSpec(req) => {
            if let Some(phase) = &req.phase
                && !matches!(phase.as_str(), "work" | "prechecks" | "postchecks")
            {
                return Err(format!("Unknown spec phase \"{phase}\""));
            }
            if req.path.trim().is_empty() {
                return Err("path must not be blank".to_string());
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_job_spec(spec: &JobNodeSpec) -> Vec<String> {
    let mut errors = Vec::new();
    if !PRODUCER_ID_RE.is_match(&spec.producer_id) {
        errors.push(format!(
            "producer_id \"{}\" must match {}",
            spec.producer_id,
            PRODUCER_ID_RE.as_str()
        ));
    }
    if spec.dependencies.len() > MAX_DEPENDENCIES {
        errors.push(format!(
            "node \"{}\" has more than {MAX_DEPENDENCIES} dependencies",
            spec.producer_id
        ));
    }
    errors
}

fn reject_if(errors: Vec<String>) -> Result<(), String> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
