//! Plan construction, mutation, and scheduling

pub mod builder;
mod error;
pub mod reshape;
pub mod scheduler;
mod state_machine;

pub use builder::{BuildOptions, DEFAULT_MAX_PARALLEL, NodeBuildContext, build_nodes, build_plan, build_single_job_plan};
pub use error::{ReshapeError, ValidationError};
pub use scheduler::{DEFAULT_GLOBAL_MAX_PARALLEL, select_nodes};
pub use state_machine::{PlanStateMachine, TransitionFields};
