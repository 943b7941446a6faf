//! Git integration

mod manager;

pub use manager::{GitManager, MergeStrategy, derive_branch_name, find_git_root};
