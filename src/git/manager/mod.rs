//! Git manager implementation

mod diff;
mod merge;
mod types;
mod worktree;

#[cfg(test)]
mod tests;

pub use merge::derive_branch_name;
pub use types::MergeStrategy;

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

/// Find the git repository root for a given path.
/// Returns None if the path is not inside a git repository.
pub fn find_git_root(path: &Path) -> Option<PathBuf> {
    let start_dir = if path.is_file() { path.parent()? } else { path };

    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(start_dir)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if root.is_empty() {
        None
    } else {
        Some(PathBuf::from(root))
    }
}

/// Manages git operations for one repository.
///
/// Repo-global operations (branch creation, ref updates) are serialized
/// through an internal lock; worktree-scoped operations run in parallel
/// across distinct worktrees.
#[derive(Clone)]
pub struct GitManager {
    /// Root directory of the repository
    root: PathBuf,

    /// Serializes repo-global operations
    pub(super) repo_lock: Arc<Mutex<()>>,
}

impl GitManager {
    /// Create a new git manager
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        if !root.join(".git").exists() {
            bail!("Not a git repository: {}", root.display());
        }

        Ok(Self {
            root,
            repo_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the current HEAD commit SHA
    pub fn head_sha(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }

    /// Resolve a revision (branch name, sha, ...) to a full commit SHA
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", &format!("{rev}^{{commit}}")])
            .current_dir(&self.root)
            .output()
            .context("Failed to run git rev-parse")?;

        if !output.status.success() {
            bail!(
                "git rev-parse {} failed: {}",
                rev,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Check if the repository has at least one commit
    pub fn has_commits(&self) -> bool {
        Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.root)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Get the current branch name
    pub fn current_branch(&self) -> Result<String> {
        let output = Command::new("git")
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(&self.root)
            .output()
            .context("Failed to get current branch")?;

        if !output.status.success() {
            bail!(
                "Failed to get current branch: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// The repository's default branch (origin HEAD when set, else the
    /// current branch)
    pub fn default_branch(&self) -> Result<String> {
        let output = Command::new("git")
            .args(["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
            .current_dir(&self.root)
            .output()
            .context("Failed to run git symbolic-ref")?;

        if output.status.success() {
            let full = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if let Some(short) = full.strip_prefix("origin/") {
                return Ok(short.to_string());
            }
            if !full.is_empty() {
                return Ok(full);
            }
        }

        self.current_branch()
    }

    /// Whether a local branch exists
    pub fn branch_exists(&self, branch: &str) -> bool {
        Command::new("git")
            .args([
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])
            .current_dir(&self.root)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Create a branch at a revision if it does not already exist.
    /// Repo-global: serialized.
    pub fn ensure_branch(&self, branch: &str, at: &str) -> Result<()> {
        let _guard = self.repo_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.branch_exists(branch) {
            return Ok(());
        }

        let output = Command::new("git")
            .args(["branch", branch, at])
            .current_dir(&self.root)
            .output()
            .context("Failed to create branch")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("already exists") {
                bail!("Failed to create branch {}: {}", branch, stderr.trim());
            }
        }
        Ok(())
    }

    /// Move a branch ref to a commit. Repo-global: serialized.
    pub fn update_branch_ref(&self, branch: &str, commit: &str) -> Result<()> {
        let _guard = self.repo_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["update-ref", &format!("refs/heads/{branch}"), commit])
            .current_dir(&self.root)
            .output()
            .context("Failed to run git update-ref")?;

        if !output.status.success() {
            bail!(
                "Failed to update branch {}: {}",
                branch,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
