//! Core domain types for dagrun

mod events;
mod exec_state;
mod group;
mod log_entry;
mod node;
mod plan;
mod work_spec;

pub use events::{PlanEvent, TransitionEvent};
pub use exec_state::{AttemptRecord, FailureReason, NodeExecutionState, StepStatus, WorkSummary};
pub use group::{GroupExecutionState, GroupId, GroupInstance};
pub use log_entry::{LogEntry, LogKind};
pub use node::{JobNode, NodeId, NodeStatus};
pub use plan::{
    FINAL_MERGE_VALIDATION_GROUP, JobNodeSpec, PlanId, PlanInstance, PlanSpec, PlanStatus,
    SNAPSHOT_VALIDATION_NAME, SNAPSHOT_VALIDATION_PRODUCER_ID, entry_map,
};
pub use work_spec::{ModelTier, OnFailure, Phase, ShellKind, WorkSpec};

use once_cell::sync::Lazy;
use regex::Regex;

/// Valid producer ids: lowercase kebab, at least 3 chars
pub static PRODUCER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{2,}$").expect("producer id regex"));

/// Slugify a free-form name into a producer id (non-alphanumerics stripped)
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if (c == '-' || c == '_' || c.is_whitespace()) && !out.is_empty() && !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_id_pattern() {
        assert!(PRODUCER_ID_RE.is_match("build-api"));
        assert!(PRODUCER_ID_RE.is_match("abc"));
        assert!(!PRODUCER_ID_RE.is_match("ab"));
        assert!(!PRODUCER_ID_RE.is_match("-abc"));
        assert!(!PRODUCER_ID_RE.is_match("Build"));
    }

    #[test]
    fn slugify_strips_non_alphanumerics() {
        assert_eq!(slugify("Fix the API!"), "fix-the-api");
        assert_eq!(slugify("  lead spaces "), "lead-spaces");
        assert_eq!(slugify("Weird***chars"), "weirdchars");
    }
}
