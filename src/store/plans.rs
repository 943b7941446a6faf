//! Plan snapshot persistence
//!
//! One directory per plan under the storage root. Snapshots are
//! last-writer-wins; readers tolerate corrupt or truncated files by
//! reporting "no plan" instead of failing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::domain::{PlanId, PlanInstance};

const PLAN_FILE: &str = "plan.json";
const INDEX_FILE: &str = "plans-index.json";
const LOCK_FILE: &str = ".lock";

/// One index entry per known plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PlanIndex {
    #[serde(default)]
    plans: HashMap<PlanId, PlanSummary>,
}

/// Store for plan snapshots under `<root>/<planId>/`
pub struct PlanStore {
    root: PathBuf,
    /// Advisory lock held for the lifetime of the store so two runner
    /// processes never share one storage root
    _lock: File,
}

impl PlanStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create {}", root.display()))?;

        let lock = File::create(root.join(LOCK_FILE)).context("Failed to create store lock")?;
        lock.try_lock_exclusive()
            .context("Plan store is locked by another dagrun process")?;

        Ok(Self { root, _lock: lock })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plan_dir(&self, plan_id: &str) -> PathBuf {
        self.root.join(plan_id)
    }

    /// Persist a snapshot (write temp file, then rename)
    pub fn save_plan(&self, plan: &PlanInstance) -> Result<()> {
        let dir = self.plan_dir(&plan.id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let json = serde_json::to_string_pretty(plan).context("Failed to serialize plan")?;
        let tmp = dir.join(format!("{PLAN_FILE}.tmp"));
        std::fs::write(&tmp, json).context("Failed to write plan snapshot")?;
        std::fs::rename(&tmp, dir.join(PLAN_FILE)).context("Failed to commit plan snapshot")?;

        self.update_index(|index| {
            index.plans.insert(
                plan.id.clone(),
                PlanSummary {
                    name: plan.spec.name.clone(),
                    created_at: plan.created_at,
                },
            );
        })
    }

    /// Load a snapshot. Corrupt or missing files yield None.
    pub fn load_plan(&self, plan_id: &str) -> Option<PlanInstance> {
        let path = self.plan_dir(plan_id).join(PLAN_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(plan) => Some(plan),
            Err(e) => {
                tracing::warn!("Corrupt plan snapshot {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Remove a plan's persisted artifacts
    pub fn delete_plan(&self, plan_id: &str) -> Result<()> {
        let dir = self.plan_dir(plan_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        self.update_index(|index| {
            index.plans.remove(plan_id);
        })
    }

    /// Known plan ids, from the index. A corrupt index yields an empty
    /// listing.
    pub fn list_plans(&self) -> HashMap<PlanId, PlanSummary> {
        self.read_index().plans
    }

    fn read_index(&self) -> PlanIndex {
        let path = self.root.join(INDEX_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return PlanIndex::default(),
        };
        match serde_json::from_str(&raw) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!("Corrupt plan index {}: {}", path.display(), e);
                PlanIndex::default()
            }
        }
    }

    fn update_index(&self, edit: impl FnOnce(&mut PlanIndex)) -> Result<()> {
        let mut index = self.read_index();
        edit(&mut index);
        let json = serde_json::to_string_pretty(&index).context("Failed to serialize index")?;
        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        std::fs::write(&tmp, json).context("Failed to write plan index")?;
        std::fs::rename(&tmp, self.root.join(INDEX_FILE)).context("Failed to commit plan index")?;
        Ok(())
    }
}
