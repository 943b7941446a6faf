//! Per-node work-spec files
//!
//! Large work specs are stored separately from the plan snapshot, one file
//! per phase under `specs/<producerId>/current/`. The legacy string form
//! (`work.md`) stays readable.

use anyhow::{Context, Result, bail};
use std::path::{Component, Path, PathBuf};

use crate::domain::{PlanInstance, WorkSpec};

const SPECS_DIR: &str = "specs";
const CURRENT_DIR: &str = "current";

fn spec_dir(plan_dir: &Path, producer_id: &str) -> PathBuf {
    plan_dir.join(SPECS_DIR).join(producer_id).join(CURRENT_DIR)
}

/// Write one node phase spec under the plan directory
pub fn save_node_spec(
    plan_dir: &Path,
    producer_id: &str,
    phase: &str,
    spec: &WorkSpec,
) -> Result<()> {
    let dir = spec_dir(plan_dir, producer_id);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let json = serde_json::to_string_pretty(spec).context("Failed to serialize spec")?;
    std::fs::write(dir.join(format!("{phase}.json")), json)
        .with_context(|| format!("Failed to write {phase} spec for {producer_id}"))?;
    Ok(())
}

/// Write every node's phase specs under the plan directory
pub fn save_plan_specs(plan_dir: &Path, plan: &PlanInstance) -> Result<()> {
    for node in plan.nodes.values() {
        let phases: [(&str, Option<&WorkSpec>); 3] = [
            ("work", node.work.as_ref()),
            ("prechecks", node.prechecks.as_ref()),
            ("postchecks", node.postchecks.as_ref()),
        ];
        for (phase, spec) in phases {
            let Some(spec) = spec else { continue };
            save_node_spec(plan_dir, &node.producer_id, phase, spec)?;
        }
    }
    Ok(())
}

/// Read one node phase spec. Falls back to the legacy `work.md` string form
/// for the work phase; a missing or corrupt file yields None.
pub fn load_node_spec(plan_dir: &Path, producer_id: &str, phase: &str) -> Option<WorkSpec> {
    let dir = spec_dir(plan_dir, producer_id);

    let json_path = dir.join(format!("{phase}.json"));
    if let Ok(raw) = std::fs::read_to_string(&json_path) {
        match serde_json::from_str(&raw) {
            Ok(spec) => return Some(spec),
            Err(e) => {
                tracing::warn!("Corrupt spec file {}: {}", json_path.display(), e);
                return None;
            }
        }
    }

    if phase == "work" {
        let legacy = dir.join("work.md");
        if let Ok(raw) = std::fs::read_to_string(&legacy) {
            return WorkSpec::parse_str(&raw).ok();
        }
    }

    None
}

/// Validate and read a user file offered as a node spec.
///
/// The source must resolve inside the workspace boundary and must not name
/// the source-control metadata directory.
pub fn import_spec_file(workspace_root: &Path, path: &Path) -> Result<String> {
    let root = workspace_root
        .canonicalize()
        .with_context(|| format!("Workspace root {} not accessible", workspace_root.display()))?;

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let resolved = absolute
        .canonicalize()
        .with_context(|| format!("Spec file {} not accessible", path.display()))?;

    if !resolved.starts_with(&root) {
        bail!(
            "Spec file {} resolves outside the workspace",
            path.display()
        );
    }
    if resolved
        .components()
        .any(|c| matches!(c, Component::Normal(name) if name == ".git"))
    {
        bail!("Spec file {} is inside the .git directory", path.display());
    }

    std::fs::read_to_string(&resolved)
        .with_context(|| format!("Failed to read {}", resolved.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_rejects_paths_outside_the_workspace() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("workspace");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(outer.path().join("secret.txt"), "nope").unwrap();

        let err = import_spec_file(&root, Path::new("../secret.txt")).unwrap_err();
        let text = format!("{err:#}");
        assert!(
            text.contains("outside the workspace") || text.contains("not accessible"),
            "unexpected error: {text}"
        );
    }

    #[test]
    fn import_rejects_git_metadata() {
        let root = tempfile::tempdir().unwrap();
        let git_dir = root.path().join(".git");
        std::fs::create_dir_all(&git_dir).unwrap();
        std::fs::write(git_dir.join("config"), "core").unwrap();

        let err = import_spec_file(root.path(), Path::new(".git/config")).unwrap_err();
        assert!(format!("{err:#}").contains(".git"));
    }

    #[test]
    fn import_reads_files_inside_the_workspace() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("spec.md"), "@agent do the thing").unwrap();

        let content = import_spec_file(root.path(), Path::new("spec.md")).unwrap();
        assert_eq!(content, "@agent do the thing");
    }

    #[test]
    fn legacy_work_md_is_readable() {
        let plan_dir = tempfile::tempdir().unwrap();
        let dir = plan_dir.path().join("specs/build-api/current");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("work.md"), "cargo build").unwrap();

        let spec = load_node_spec(plan_dir.path(), "build-api", "work").unwrap();
        assert_eq!(spec, WorkSpec::shell("cargo build"));
    }
}
