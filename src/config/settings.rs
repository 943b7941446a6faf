//! Settings configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::git::MergeStrategy;

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum nodes in flight across all plans
    #[serde(default = "default_global_max_parallel")]
    pub global_max_parallel: usize,

    /// Prefix for derived target branches (trailing slashes are ignored)
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    /// Conflict resolution for FI/RI merges
    #[serde(default)]
    pub merge_strategy: MergeStrategy,

    /// Override for the plan storage directory
    #[serde(default)]
    pub storage_root: Option<PathBuf>,

    /// Port for the local control API
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Seconds a canceled process gets between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    /// Agent CLI invocation settings
    #[serde(default)]
    pub agent: AgentSettings,
}

fn default_global_max_parallel() -> usize {
    crate::plan::DEFAULT_GLOBAL_MAX_PARALLEL
}

fn default_branch_prefix() -> String {
    "dagrun".to_string()
}

fn default_http_port() -> u16 {
    9877
}

fn default_kill_grace_secs() -> u64 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            global_max_parallel: default_global_max_parallel(),
            branch_prefix: default_branch_prefix(),
            merge_strategy: MergeStrategy::default(),
            storage_root: None,
            http_port: default_http_port(),
            kill_grace_secs: default_kill_grace_secs(),
            agent: AgentSettings::default(),
        }
    }
}

/// How agent work specs are launched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// The agent CLI binary
    #[serde(default = "default_agent_binary")]
    pub binary: String,

    /// Base arguments for a non-interactive streamed run
    #[serde(default = "default_agent_args")]
    pub run_args: Vec<String>,

    /// Model used for the `fast` tier
    #[serde(default)]
    pub model_fast: Option<String>,

    /// Model used for the `standard` tier
    #[serde(default)]
    pub model_standard: Option<String>,

    /// Model used for the `premium` tier
    #[serde(default)]
    pub model_premium: Option<String>,
}

fn default_agent_binary() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ]
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            run_args: default_agent_args(),
            model_fast: None,
            model_standard: None,
            model_premium: None,
        }
    }
}

impl AgentSettings {
    /// Resolve the model for a spec's explicit model or tier
    pub fn resolve_model(
        &self,
        model: Option<&str>,
        tier: Option<crate::domain::ModelTier>,
    ) -> Option<String> {
        if let Some(model) = model {
            return Some(model.to_string());
        }
        match tier? {
            crate::domain::ModelTier::Fast => self.model_fast.clone(),
            crate::domain::ModelTier::Standard => self.model_standard.clone(),
            crate::domain::ModelTier::Premium => self.model_premium.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.global_max_parallel, 8);
        assert_eq!(settings.branch_prefix, "dagrun");
        assert_eq!(settings.merge_strategy, MergeStrategy::Theirs);
        assert_eq!(settings.agent.binary, "claude");
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let settings: Settings =
            toml::from_str("global_max_parallel = 2\n[agent]\nbinary = \"codex\"\n").unwrap();
        assert_eq!(settings.global_max_parallel, 2);
        assert_eq!(settings.agent.binary, "codex");
        assert_eq!(settings.http_port, 9877);
    }
}
