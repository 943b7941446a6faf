//! Node execution: phase driving, process/shell/agent work, cancellation

mod agent;
mod context;
mod executor;
mod process;

pub use context::{CancelHandle, CancelSignal, DependencyCommit, ExecutionContext, LogSink};
pub use executor::{JobExecutionResult, execute};
pub use process::SpecOutcome;

use crate::domain::{Phase, WorkSpec};

/// Run a single work spec in the context's worktree (used by the runner for
/// corrective auto-heal executions)
pub async fn run_work_spec(ctx: &ExecutionContext, phase: Phase, spec: &WorkSpec) -> SpecOutcome {
    match spec {
        WorkSpec::Agent { .. } => agent::run_agent_spec(ctx, phase, spec).await,
        _ => process::run_command_spec(ctx, phase, spec).await,
    }
}
