//! Git types shared across manager operations

use serde::{Deserialize, Serialize};

/// Conflict resolution strategy for FI/RI merges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Keep the worktree's side on conflict
    Ours,
    /// Take the incoming commit's side on conflict
    #[default]
    Theirs,
}

impl MergeStrategy {
    /// The `-X` merge option argument
    pub fn merge_option(&self) -> &'static str {
        match self {
            MergeStrategy::Ours => "ours",
            MergeStrategy::Theirs => "theirs",
        }
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.merge_option())
    }
}

/// Parse `git diff --name-status` output into (status letter, path) pairs
pub(super) fn parse_name_status(output: &[u8]) -> Vec<(char, String)> {
    let text = String::from_utf8_lossy(output);
    let mut results = Vec::new();

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split('\t');
        let Some(status) = parts.next().and_then(|s| s.chars().next()) else {
            continue;
        };
        let Some(path) = parts.next() else {
            continue;
        };
        if !path.is_empty() {
            results.push((status, path.to_string()));
        }
    }

    results
}
