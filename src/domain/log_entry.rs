//! Log entries written to the on-disk log store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Phase;

/// The kind of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Stdout,
    Stderr,
    Info,
    Error,
}

/// One line in a node's execution log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub kind: LogKind,
    pub message: String,
}

impl LogEntry {
    pub fn new(phase: Phase, kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            phase,
            kind,
            message: message.into(),
        }
    }

    pub fn stdout(phase: Phase, message: impl Into<String>) -> Self {
        Self::new(phase, LogKind::Stdout, message)
    }

    pub fn stderr(phase: Phase, message: impl Into<String>) -> Self {
        Self::new(phase, LogKind::Stderr, message)
    }

    pub fn info(phase: Phase, message: impl Into<String>) -> Self {
        Self::new(phase, LogKind::Info, message)
    }

    pub fn error(phase: Phase, message: impl Into<String>) -> Self {
        Self::new(phase, LogKind::Error, message)
    }
}
