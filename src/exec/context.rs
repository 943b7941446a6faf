//! Execution context handed to the executor for one node run

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

use crate::config::AgentSettings;
use crate::domain::{JobNode, LogEntry, PlanId, Phase};
use crate::git::{GitManager, MergeStrategy};

/// Cancel half: cancels every signal cloned from it
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observe half of a cancellation signal
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that never fires (for tests and detached runs)
    pub fn never() -> CancelSignal {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the signal stays quiet.
        std::mem::forget(tx);
        CancelSignal { rx }
    }

    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when canceled; pends forever otherwise
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Where executor output lines go (the runner points this at the log store)
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<dyn Fn(LogEntry) + Send + Sync>,
}

impl LogSink {
    pub fn new(f: impl Fn(LogEntry) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    /// A sink that drops everything
    pub fn null() -> Self {
        Self::new(|_| {})
    }

    pub fn append(&self, entry: LogEntry) {
        (self.inner)(entry);
    }
}

/// A dependency's output commit, for forward integration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCommit {
    pub node_id: String,
    pub commit: String,
}

/// Everything the executor needs to run one node
pub struct ExecutionContext {
    pub plan_id: PlanId,
    pub node: JobNode,

    /// The commit the worktree was created from
    pub base_commit: String,

    /// The plan's base branch, for leaf aggregated summaries
    pub base_branch: String,

    pub worktree_path: PathBuf,

    /// Dependency commits to forward-integrate, ascending by node id
    pub dependencies: Vec<DependencyCommit>,

    /// Whether the node is a leaf of the plan
    pub is_leaf: bool,

    pub merge_strategy: MergeStrategy,
    pub cancel: CancelSignal,

    /// Prior agent session to resume, if any
    pub resume_session_id: Option<String>,

    /// Skip phases before this one (heal resume)
    pub resume_from_phase: Option<Phase>,

    pub agent: AgentSettings,
    pub git: GitManager,
    pub log: LogSink,

    /// Receives the work process pid as soon as it spawns
    pub pid_notify: Option<UnboundedSender<u32>>,

    /// Grace period between the terminate signal and the hard kill
    pub kill_grace: std::time::Duration,
}
