//! Work specifications: what a node should do
//!
//! A work spec is a tagged variant (`process`, `shell`, `agent`). Legacy
//! plain-string specs are normalized at the boundary: an `@agent` prefix
//! yields an agent spec, anything else a shell spec.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Execution phase of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "setup")]
    Setup,
    #[serde(rename = "merge-fi")]
    MergeFi,
    #[serde(rename = "prechecks")]
    Prechecks,
    #[serde(rename = "work")]
    Work,
    #[serde(rename = "commit")]
    Commit,
    #[serde(rename = "postchecks")]
    Postchecks,
    #[serde(rename = "merge-ri")]
    MergeRi,
    #[serde(rename = "cleanup")]
    Cleanup,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::MergeFi => "merge-fi",
            Phase::Prechecks => "prechecks",
            Phase::Work => "work",
            Phase::Commit => "commit",
            Phase::Postchecks => "postchecks",
            Phase::MergeRi => "merge-ri",
            Phase::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named shell for `shell` specs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Cmd,
    Powershell,
    Pwsh,
    Bash,
    Sh,
}

impl ShellKind {
    /// The executable and the flag that takes a command string
    pub fn invocation(&self) -> (&'static str, &'static str) {
        match self {
            ShellKind::Cmd => ("cmd", "/C"),
            ShellKind::Powershell => ("powershell", "-Command"),
            ShellKind::Pwsh => ("pwsh", "-Command"),
            ShellKind::Bash => ("bash", "-c"),
            ShellKind::Sh => ("sh", "-c"),
        }
    }
}

/// Model tier for agent specs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    Standard,
    Premium,
}

/// Failure-handling overrides carried by a work spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnFailure {
    /// Suppress auto-heal for this spec even when the plan enables it
    #[serde(default)]
    pub no_auto_heal: bool,

    /// User-visible message shown instead of the raw error text
    #[serde(default)]
    pub message: Option<String>,

    /// Phase to resume from after a heal attempt (default: the failing phase)
    #[serde(default)]
    pub resume_from_phase: Option<Phase>,
}

/// What a node should do in one of its phases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkSpec {
    /// Run an executable directly
    #[serde(rename_all = "camelCase")]
    Process {
        executable: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Option<HashMap<String, String>>,
        #[serde(default)]
        cwd: Option<String>,
        /// Timeout in milliseconds
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default, alias = "errorAction")]
        on_failure: Option<OnFailure>,
    },

    /// Run a command string through a shell
    #[serde(rename_all = "camelCase")]
    Shell {
        command: String,
        #[serde(default)]
        shell: Option<ShellKind>,
        #[serde(default)]
        env: Option<HashMap<String, String>>,
        #[serde(default)]
        cwd: Option<String>,
        /// Timeout in milliseconds
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default, alias = "errorAction")]
        on_failure: Option<OnFailure>,
    },

    /// Delegate to an AI coding agent
    #[serde(rename_all = "camelCase")]
    Agent {
        instructions: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        model_tier: Option<ModelTier>,
        /// Context files to put in scope for the agent
        #[serde(default)]
        context: Option<Vec<String>>,
        #[serde(default)]
        max_turns: Option<u32>,
        /// Folders the agent may touch (the worktree is always added)
        #[serde(default)]
        allowed_folders: Option<Vec<String>>,
        #[serde(default)]
        allowed_urls: Option<Vec<String>>,
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default, alias = "errorAction")]
        on_failure: Option<OnFailure>,
    },
}

impl WorkSpec {
    /// Shortcut constructor for a plain shell command
    pub fn shell(command: impl Into<String>) -> Self {
        WorkSpec::Shell {
            command: command.into(),
            shell: None,
            env: None,
            cwd: None,
            timeout: None,
            on_failure: None,
        }
    }

    /// Shortcut constructor for agent instructions
    pub fn agent(instructions: impl Into<String>) -> Self {
        WorkSpec::Agent {
            instructions: instructions.into(),
            model: None,
            model_tier: None,
            context: None,
            max_turns: None,
            allowed_folders: None,
            allowed_urls: None,
            timeout: None,
            on_failure: None,
        }
    }

    /// The failure-handling overrides, if any
    pub fn on_failure(&self) -> Option<&OnFailure> {
        match self {
            WorkSpec::Process { on_failure, .. }
            | WorkSpec::Shell { on_failure, .. }
            | WorkSpec::Agent { on_failure, .. } => on_failure.as_ref(),
        }
    }

    /// Timeout in milliseconds, if any
    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            WorkSpec::Process { timeout, .. }
            | WorkSpec::Shell { timeout, .. }
            | WorkSpec::Agent { timeout, .. } => *timeout,
        }
    }

    /// Normalize a boundary value into a work spec.
    ///
    /// Accepts structured JSON objects (with a `type` tag), JSON-shaped
    /// strings, and legacy plain strings. Snake_case keys are rewritten to
    /// camelCase before deserialization; this is the only place lenient key
    /// handling happens.
    pub fn parse(value: &serde_json::Value) -> Result<WorkSpec> {
        match value {
            serde_json::Value::String(s) => Self::parse_str(s),
            serde_json::Value::Object(_) => {
                let normalized = normalize_keys(value.clone());
                serde_json::from_value(normalized).context("Invalid work spec object")
            }
            other => bail!("Work spec must be a string or object, got {}", other),
        }
    }

    /// Normalize a legacy string spec
    pub fn parse_str(raw: &str) -> Result<WorkSpec> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            bail!("Work spec string is empty");
        }

        // JSON-shaped strings with a `type` field are structured specs.
        if trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                if value.get("type").is_some() {
                    let normalized = normalize_keys(value);
                    return serde_json::from_value(normalized)
                        .context("Invalid work spec JSON string");
                }
            }
        }

        if let Some(rest) = trimmed.strip_prefix("@agent") {
            let instructions = rest.trim();
            if instructions.is_empty() {
                bail!("@agent spec has no instructions");
            }
            return Ok(WorkSpec::agent(instructions));
        }

        Ok(WorkSpec::shell(trimmed))
    }
}

/// Rewrite recognized snake_case keys to the camelCase wire dialect.
///
/// Applied recursively so `on_failure` sub-records normalize too.
fn normalize_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                let key = match key.as_str() {
                    "on_failure" => "onFailure".to_string(),
                    "no_auto_heal" => "noAutoHeal".to_string(),
                    "resume_from_phase" => "resumeFromPhase".to_string(),
                    "model_tier" => "modelTier".to_string(),
                    "error_action" => "errorAction".to_string(),
                    "max_turns" => "maxTurns".to_string(),
                    "allowed_folders" => "allowedFolders".to_string(),
                    "allowed_urls" => "allowedUrls".to_string(),
                    _ => key,
                };
                out.insert(key, normalize_keys(val));
            }
            serde_json::Value::Object(out)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_string_becomes_shell() {
        let spec = WorkSpec::parse_str("cargo test").unwrap();
        assert_eq!(spec, WorkSpec::shell("cargo test"));
    }

    #[test]
    fn agent_prefix_becomes_agent() {
        let spec = WorkSpec::parse_str("@agent fix the failing tests").unwrap();
        match spec {
            WorkSpec::Agent { instructions, .. } => {
                assert_eq!(instructions, "fix the failing tests");
            }
            other => panic!("Expected agent spec, got {:?}", other),
        }
    }

    #[test]
    fn json_string_with_type_is_structured() {
        let spec = WorkSpec::parse_str(r#"{"type":"process","executable":"make","args":["check"]}"#)
            .unwrap();
        match spec {
            WorkSpec::Process {
                executable, args, ..
            } => {
                assert_eq!(executable, "make");
                assert_eq!(args, vec!["check"]);
            }
            other => panic!("Expected process spec, got {:?}", other),
        }
    }

    #[test]
    fn snake_case_keys_are_rewritten() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{
                "type": "shell",
                "command": "cargo build",
                "on_failure": {"no_auto_heal": true, "resume_from_phase": "work"}
            }"#,
        )
        .unwrap();
        let spec = WorkSpec::parse(&value).unwrap();
        let on_failure = spec.on_failure().expect("on_failure should survive");
        assert!(on_failure.no_auto_heal);
        assert_eq!(on_failure.resume_from_phase, Some(Phase::Work));
    }

    #[test]
    fn error_action_is_accepted_as_on_failure() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{"type":"shell","command":"true","error_action":{"message":"boom"}}"#,
        )
        .unwrap();
        let spec = WorkSpec::parse(&value).unwrap();
        assert_eq!(
            spec.on_failure().and_then(|f| f.message.as_deref()),
            Some("boom")
        );
    }

    #[test]
    fn empty_string_is_rejected() {
        assert!(WorkSpec::parse_str("   ").is_err());
    }

    #[test]
    fn phase_round_trips_through_serde() {
        let json = serde_json::to_string(&Phase::MergeFi).unwrap();
        assert_eq!(json, "\"merge-fi\"");
        let back: Phase = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Phase::MergeFi);
    }
}
