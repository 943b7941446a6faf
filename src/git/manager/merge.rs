//! Forward- and reverse-integration merges

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::Command;

use super::{GitManager, MergeStrategy};

impl GitManager {
    /// Merge a commit into a worktree (forward integration).
    ///
    /// Conflicts resolve per the strategy; a merge that still fails is
    /// aborted so the worktree stays usable, and the git error is returned.
    pub fn merge_commit_into_worktree(
        &self,
        worktree: &Path,
        commit: &str,
        strategy: MergeStrategy,
    ) -> Result<()> {
        let output = Command::new("git")
            .args([
                "merge",
                "--no-edit",
                "-X",
                strategy.merge_option(),
                commit,
            ])
            .current_dir(worktree)
            .output()
            .context("Failed to run git merge")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

            let abort = Command::new("git")
                .args(["merge", "--abort"])
                .current_dir(worktree)
                .output();
            if let Ok(out) = abort
                && !out.status.success()
            {
                tracing::warn!(
                    "git merge --abort failed: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                );
            }

            bail!(
                "Merge of {} with strategy {} failed: {}",
                &commit[..commit.len().min(12)],
                strategy,
                if stderr.is_empty() { stdout } else { stderr }
            );
        }

        Ok(())
    }

    /// Merge a commit into a branch without disturbing any checkout
    /// (reverse integration to the target branch).
    ///
    /// Runs the merge in a temporary detached worktree at the branch tip,
    /// then fast-forwards the branch ref to the merge result.
    pub fn merge_commit_into_branch(
        &self,
        branch: &str,
        commit: &str,
        strategy: MergeStrategy,
        scratch_dir: &Path,
    ) -> Result<String> {
        let branch_tip = self.rev_parse(branch)?;

        // Already contained: nothing to do.
        if self.is_ancestor(commit, &branch_tip)? {
            return Ok(branch_tip);
        }

        let tmp = scratch_dir.join(format!("ri-{}", &commit[..commit.len().min(12)]));
        self.create_detached_worktree(&tmp, &branch_tip)?;

        let merge_result = self.merge_commit_into_worktree(&tmp, commit, strategy);
        let outcome = match merge_result {
            Ok(()) => {
                let merged = self.worktree_head(&tmp)?;
                self.update_branch_ref(branch, &merged)?;
                Ok(merged)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = self.remove_worktree(&tmp) {
            tracing::warn!("Failed to remove scratch worktree: {e:#}");
        }

        outcome
    }

    /// Whether `ancestor` is reachable from `descendant`
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = Command::new("git")
            .args(["merge-base", "--is-ancestor", ancestor, descendant])
            .current_dir(self.root())
            .output()
            .context("Failed to run git merge-base")?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => bail!(
                "git merge-base failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }
}

/// Derive a target branch name from a prefix and a plan name.
///
/// Trailing slashes on the prefix are stripped before joining so the result
/// never contains `//`.
pub fn derive_branch_name(prefix: &str, plan_name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let slug = crate::domain::slugify(plan_name);
    if prefix.is_empty() {
        slug
    } else {
        format!("{prefix}/{slug}")
    }
}
