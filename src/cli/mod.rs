//! CLI command implementations

pub mod node;
pub mod plan;
pub mod serve;

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::runner::Runner;

/// Build a runner for the repository and load persisted plans
pub async fn open_runner(repo_path: &Path, config_path: Option<&Path>) -> Result<Runner> {
    let config = Config::load(repo_path, config_path)?;
    let runner = Runner::new(config).context("Failed to open the plan store")?;
    runner.initialize().await?;
    Ok(runner)
}
