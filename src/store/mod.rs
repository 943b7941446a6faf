//! On-disk persistence: plan snapshots, spec files, and execution logs

mod logs;
mod plans;
mod specs;

pub use logs::{LogStore, log_key};
pub use plans::{PlanStore, PlanSummary};
pub use specs::{import_spec_file, load_node_spec, save_node_spec, save_plan_specs};
