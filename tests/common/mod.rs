//! Shared test helpers

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use dagrun::config::{Config, Settings};

pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A scratch repository with one commit on `main`
pub fn create_test_repo() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    git(dir.path(), &["init", "-b", "main"]);
    git(dir.path(), &["config", "user.email", "test@example.com"]);
    git(dir.path(), &["config", "user.name", "Test User"]);
    std::fs::write(dir.path().join("README.md"), "test repo\n").expect("write");
    git(dir.path(), &["add", "-A"]);
    git(dir.path(), &["commit", "-m", "initial commit"]);
    dir
}

/// Config pointing storage at a scratch directory inside the repo
pub fn test_config(repo: &Path) -> Config {
    Config {
        settings: Settings {
            storage_root: Some(repo.join(".dagrun").join("plans")),
            ..Default::default()
        },
        repo_path: repo.to_path_buf(),
    }
}

/// Read a file from a branch without checking it out
pub fn show_file(repo: &Path, branch: &str, file: &str) -> Option<String> {
    let output = Command::new("git")
        .args(["show", &format!("{branch}:{file}")])
        .current_dir(repo)
        .output()
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        None
    }
}

pub fn branch_exists(repo: &Path, branch: &str) -> bool {
    Command::new("git")
        .args([
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])
        .current_dir(repo)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn worktree_root(repo: &Path) -> PathBuf {
    repo.join(".dagrun").join("worktrees")
}
