//! Worktree operations for GitManager
//!
//! Node worktrees are detached-HEAD checkouts at a specific commit; no named
//! branch is created for them.

use anyhow::{Context, Result, anyhow, bail};
use std::path::Path;
use std::process::Command;

use super::GitManager;

impl GitManager {
    /// Create a detached worktree at a commit. The parent directory is
    /// created as needed. Repo-global: serialized.
    pub fn create_detached_worktree(&self, worktree_path: &Path, commit: &str) -> Result<()> {
        let _guard = self.repo_lock.lock().unwrap_or_else(|e| e.into_inner());

        if !self.has_commits() {
            bail!(
                "Cannot create worktree: repository has no commits. \
                Please make an initial commit first."
            );
        }

        if worktree_path.exists() {
            bail!(
                "Cannot create worktree: {} already exists",
                worktree_path.display()
            );
        }

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let worktree_path_str = worktree_path
            .to_str()
            .ok_or_else(|| anyhow!("Worktree path contains invalid UTF-8"))?;

        let output = Command::new("git")
            .args(["worktree", "add", "--detach", worktree_path_str, commit])
            .current_dir(self.root())
            .output()
            .context("Failed to create worktree")?;

        if !output.status.success() {
            bail!(
                "Failed to create worktree at {}: {}",
                commit,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }

    /// Remove a worktree from disk and from git's registry.
    /// Repo-global: serialized.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        let _guard = self.repo_lock.lock().unwrap_or_else(|e| e.into_inner());

        if worktree_path.exists() {
            let worktree_path_str = worktree_path
                .to_str()
                .ok_or_else(|| anyhow!("Worktree path contains invalid UTF-8"))?;
            let output = Command::new("git")
                .args(["worktree", "remove", "--force", worktree_path_str])
                .current_dir(self.root())
                .output()
                .context("Failed to remove worktree")?;

            if !output.status.success() {
                tracing::warn!(
                    "Failed to remove worktree: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                // Fall back to a plain directory removal so reclamation
                // still converges.
                let _ = std::fs::remove_dir_all(worktree_path);
            }
        }

        self.prune_worktrees();
        Ok(())
    }

    /// Drop stale worktree registrations (best effort)
    pub fn prune_worktrees(&self) {
        let _ = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(self.root())
            .output();
    }

    /// Check if the working copy of a worktree is clean
    pub fn is_clean(&self, worktree: &Path) -> Result<bool> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(worktree)
            .output()
            .context("Failed to run git status")?;

        if !output.status.success() {
            bail!(
                "git status failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(output.stdout.is_empty())
    }

    /// The HEAD commit of a worktree
    pub fn worktree_head(&self, worktree: &Path) -> Result<String> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(worktree)
            .output()
            .context("Failed to run git rev-parse")?;

        if !output.status.success() {
            bail!(
                "git rev-parse failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Stage everything and commit in a worktree.
    ///
    /// Returns the new commit SHA, or None when there was nothing to commit.
    pub fn commit_all(&self, worktree: &Path, message: &str) -> Result<Option<String>> {
        let output = Command::new("git")
            .args(["add", "-A"])
            .current_dir(worktree)
            .output()
            .context("Failed to run git add")?;

        if !output.status.success() {
            bail!(
                "git add failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        if self.is_clean(worktree)? {
            return Ok(None);
        }

        let output = Command::new("git")
            .args(["commit", "-m", message])
            .current_dir(worktree)
            .output()
            .context("Failed to run git commit")?;

        if !output.status.success() {
            bail!(
                "git commit failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(Some(self.worktree_head(worktree)?))
    }
}
