//! Configuration loaded from `.dagrun/config.toml`

mod settings;

pub use settings::{AgentSettings, Settings};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Directory holding dagrun state inside a repository
pub const DAGRUN_DIR: &str = ".dagrun";

/// Loaded configuration plus the paths it resolves against
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,

    /// Repository root the config belongs to
    pub repo_path: PathBuf,
}

impl Config {
    /// Load configuration for a repository. A missing file yields defaults;
    /// a malformed file is an error.
    pub fn load(repo_path: &Path, config_path: Option<&Path>) -> Result<Config> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.join(DAGRUN_DIR).join("config.toml"));

        let settings = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Settings::default()
        };

        Ok(Config {
            settings,
            repo_path: repo_path.to_path_buf(),
        })
    }

    /// Where plan snapshots, specs, and logs live
    pub fn storage_root(&self) -> PathBuf {
        self.settings
            .storage_root
            .clone()
            .unwrap_or_else(|| self.repo_path.join(DAGRUN_DIR).join("plans"))
    }

    /// Where plan worktrees live by default
    pub fn worktree_root(&self) -> PathBuf {
        self.repo_path.join(DAGRUN_DIR).join("worktrees")
    }
}
