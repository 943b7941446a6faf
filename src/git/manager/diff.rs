//! Diff statistics for work summaries

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::Command;

use super::GitManager;
use super::types::parse_name_status;
use crate::domain::WorkSummary;

impl GitManager {
    /// Summarize a worktree's changes vs a base revision.
    ///
    /// Counts added/modified/deleted files (status letters A, M, D; renames
    /// are ignored) plus the commit count in `base..HEAD`.
    pub fn work_summary(&self, worktree: &Path, base: &str) -> Result<WorkSummary> {
        let range = format!("{base}..HEAD");

        let output = Command::new("git")
            .args(["diff", "--name-status", &range])
            .current_dir(worktree)
            .output()
            .context("Failed to run git diff --name-status")?;

        if !output.status.success() {
            bail!(
                "git diff failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let mut summary = WorkSummary::default();
        for (status, _path) in parse_name_status(&output.stdout) {
            match status {
                'A' => summary.files_added += 1,
                'M' => summary.files_modified += 1,
                'D' => summary.files_deleted += 1,
                _ => {}
            }
        }

        let output = Command::new("git")
            .args(["rev-list", "--count", &range])
            .current_dir(worktree)
            .output()
            .context("Failed to run git rev-list")?;

        if !output.status.success() {
            bail!(
                "git rev-list failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        summary.commit_count = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .unwrap_or(0);

        Ok(summary)
    }

    /// Like [`work_summary`] but degrades to zeros instead of failing, for
    /// callers that must never fail the node over statistics.
    ///
    /// [`work_summary`]: GitManager::work_summary
    pub fn work_summary_or_zero(&self, worktree: &Path, base: &str) -> WorkSummary {
        match self.work_summary(worktree, base) {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!("Work summary computation failed: {e:#}");
                WorkSummary::default()
            }
        }
    }
}
