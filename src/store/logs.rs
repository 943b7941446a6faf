//! Execution log store
//!
//! One file per `(planId, nodeId, attempt)` key with a header line followed
//! by one JSON line per entry. Appends are single line-level writes so a
//! concurrent reader never sees a torn entry; reads may resume from a byte
//! offset.

use anyhow::{Context, Result};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::domain::LogEntry;

const HEADER_PREFIX: &str = "#dagrun-log";

/// Build the sanitized file key for a node attempt
pub fn log_key(plan_id: &str, node_id: &str, attempt: u32) -> String {
    sanitize(&format!("{plan_id}:{node_id}:{attempt}"))
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Store for node execution logs under a root directory
#[derive(Clone)]
pub struct LogStore {
    root: PathBuf,
}

impl LogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.log"))
    }

    /// Append one entry. Creates the file (with its header) on first write.
    pub fn append(&self, key: &str, entry: &LogEntry) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create {}", self.root.display()))?;
        let path = self.path_for(key);
        let is_new = !path.exists();

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let mut buf = String::new();
        if is_new {
            buf.push_str(&format!("{HEADER_PREFIX} {key} v1\n"));
        }
        buf.push_str(&serde_json::to_string(entry).context("Failed to serialize log entry")?);
        buf.push('\n');

        file.write_all(buf.as_bytes())
            .context("Failed to append log entry")?;
        Ok(())
    }

    /// All entries for a key. Missing files and bad lines are tolerated.
    pub fn read_all(&self, key: &str) -> Vec<LogEntry> {
        self.read_from_offset(key, 0).0
    }

    /// The last `n` entries
    pub fn read_tail(&self, key: &str, n: usize) -> Vec<LogEntry> {
        let mut entries = self.read_all(key);
        if entries.len() > n {
            entries.drain(..entries.len() - n);
        }
        entries
    }

    /// Read entries starting at a byte offset; returns the entries and the
    /// offset to resume from (the end of the last complete line).
    pub fn read_from_offset(&self, key: &str, offset: u64) -> (Vec<LogEntry>, u64) {
        let path = self.path_for(key);
        let mut file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(_) => return (Vec::new(), offset),
        };
        if file.seek(SeekFrom::Start(offset)).is_err() {
            return (Vec::new(), offset);
        }

        let mut raw = String::new();
        if file.read_to_string(&mut raw).is_err() {
            return (Vec::new(), offset);
        }

        let mut entries = Vec::new();
        let mut consumed = 0u64;
        for line in raw.split_inclusive('\n') {
            if !line.ends_with('\n') {
                // Partial trailing line: a writer is mid-append.
                break;
            }
            consumed += line.len() as u64;
            let trimmed = line.trim_end();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<LogEntry>(trimmed) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("Skipping bad log line in {}: {}", path.display(), e),
            }
        }

        (entries, offset + consumed)
    }

    /// Remove every log file belonging to a plan
    pub fn delete_plan_logs(&self, plan_id: &str) {
        let prefix = format!("{}_", sanitize(plan_id));
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str()
                && name.starts_with(&prefix)
            {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Phase;

    #[test]
    fn key_is_sanitized() {
        let key = log_key("plan/1", "node:2", 3);
        assert_eq!(key, "plan_1_node_2_3");
    }

    #[test]
    fn append_and_tail_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let key = log_key("p1", "n1", 1);

        for i in 0..5 {
            store
                .append(&key, &LogEntry::stdout(Phase::Work, format!("line {i}")))
                .unwrap();
        }

        let all = store.read_all(&key);
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].message, "line 0");

        let tail = store.read_tail(&key, 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].message, "line 4");
    }

    #[test]
    fn offset_reads_resume_where_they_left_off() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let key = log_key("p1", "n1", 1);

        store
            .append(&key, &LogEntry::info(Phase::Setup, "first"))
            .unwrap();
        let (entries, offset) = store.read_from_offset(&key, 0);
        assert_eq!(entries.len(), 1);

        store
            .append(&key, &LogEntry::info(Phase::Setup, "second"))
            .unwrap();
        let (entries, _) = store.read_from_offset(&key, offset);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "second");
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path());
        assert!(store.read_all("missing").is_empty());
    }
}
