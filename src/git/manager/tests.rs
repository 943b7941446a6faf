//! Unit tests for GitManager against scratch repositories

use std::fs;
use std::path::Path;
use std::process::Command;

use super::merge::derive_branch_name;
use super::{GitManager, MergeStrategy};

fn git(dir: &Path, args: &[&str]) {
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

fn init_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    git(dir.path(), &["init", "-b", "main"]);
    git(dir.path(), &["config", "user.email", "test@example.com"]);
    git(dir.path(), &["config", "user.name", "Test"]);
    fs::write(dir.path().join("README.md"), "hello\n").unwrap();
    git(dir.path(), &["add", "-A"]);
    git(dir.path(), &["commit", "-m", "initial"]);
    dir
}

#[test]
fn rev_parse_resolves_head() {
    let repo = init_repo();
    let manager = GitManager::new(repo.path()).unwrap();
    let sha = manager.rev_parse("main").unwrap();
    assert_eq!(sha.len(), 40);
    assert_eq!(sha, manager.head_sha().unwrap());
}

#[test]
fn detached_worktree_checks_out_commit() {
    let repo = init_repo();
    let manager = GitManager::new(repo.path()).unwrap();
    let head = manager.head_sha().unwrap();

    let wt = repo.path().join("wt").join("node-build");
    manager.create_detached_worktree(&wt, &head).unwrap();
    assert!(wt.join("README.md").exists());
    assert_eq!(manager.worktree_head(&wt).unwrap(), head);

    manager.remove_worktree(&wt).unwrap();
    assert!(!wt.exists());
}

#[test]
fn commit_all_returns_none_when_clean() {
    let repo = init_repo();
    let manager = GitManager::new(repo.path()).unwrap();
    let head = manager.head_sha().unwrap();

    let wt = repo.path().join("wt").join("node-check");
    manager.create_detached_worktree(&wt, &head).unwrap();

    assert_eq!(manager.commit_all(&wt, "no changes").unwrap(), None);

    fs::write(wt.join("new.txt"), "work\n").unwrap();
    let sha = manager.commit_all(&wt, "did work").unwrap();
    assert!(sha.is_some());
    assert_ne!(sha.unwrap(), head);
}

#[test]
fn merge_brings_dependency_output_forward() {
    let repo = init_repo();
    let manager = GitManager::new(repo.path()).unwrap();
    let base = manager.head_sha().unwrap();

    // Producer commits a file in its own worktree.
    let producer = repo.path().join("wt").join("node-producer");
    manager.create_detached_worktree(&producer, &base).unwrap();
    fs::write(producer.join("produced.txt"), "output\n").unwrap();
    let produced = manager
        .commit_all(&producer, "producer: output")
        .unwrap()
        .unwrap();

    // Consumer starts from the same base and merges the producer in.
    let consumer = repo.path().join("wt").join("node-consumer");
    manager.create_detached_worktree(&consumer, &base).unwrap();
    manager
        .merge_commit_into_worktree(&consumer, &produced, MergeStrategy::Theirs)
        .unwrap();

    assert!(consumer.join("produced.txt").exists());
}

#[test]
fn merge_into_branch_updates_ref_without_checkout() {
    let repo = init_repo();
    let manager = GitManager::new(repo.path()).unwrap();
    let base = manager.head_sha().unwrap();
    manager.ensure_branch("integration", &base).unwrap();

    let wt = repo.path().join("wt").join("node-work");
    manager.create_detached_worktree(&wt, &base).unwrap();
    fs::write(wt.join("feature.txt"), "done\n").unwrap();
    let commit = manager.commit_all(&wt, "feature").unwrap().unwrap();

    let scratch = repo.path().join("wt");
    let merged = manager
        .merge_commit_into_branch("integration", &commit, MergeStrategy::Theirs, &scratch)
        .unwrap();

    assert_eq!(manager.rev_parse("integration").unwrap(), merged);
    assert!(manager.is_ancestor(&commit, &merged).unwrap());
}

#[test]
fn work_summary_counts_file_statuses() {
    let repo = init_repo();
    let manager = GitManager::new(repo.path()).unwrap();
    let base = manager.head_sha().unwrap();

    let wt = repo.path().join("wt").join("node-stats");
    manager.create_detached_worktree(&wt, &base).unwrap();
    fs::write(wt.join("added.txt"), "new\n").unwrap();
    fs::write(wt.join("README.md"), "hello changed\n").unwrap();
    manager.commit_all(&wt, "changes").unwrap().unwrap();

    let summary = manager.work_summary(&wt, &base).unwrap();
    assert_eq!(summary.files_added, 1);
    assert_eq!(summary.files_modified, 1);
    assert_eq!(summary.files_deleted, 0);
    assert_eq!(summary.commit_count, 1);
}

#[test]
fn work_summary_or_zero_swallows_bad_revs() {
    let repo = init_repo();
    let manager = GitManager::new(repo.path()).unwrap();
    let summary = manager.work_summary_or_zero(repo.path(), "not-a-rev");
    assert_eq!(summary, Default::default());
}

#[test]
fn derive_branch_name_strips_prefix_slashes() {
    assert_eq!(derive_branch_name("flow/", "Big Plan"), "flow/big-plan");
}
