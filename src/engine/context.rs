//! Capabilities and per-step context handed to executors.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::agent::AgentRunner;
use crate::config::AtlasConfig;
use crate::error::AtlasError;
use crate::forge::ForgeClient;
use crate::logging::TaskLogger;
use crate::model::{Task, TaskStatus, Workspace};
use crate::store::Store;
use crate::validate::CancelToken;
use crate::vcs::VcsRunner;

/// Attention-required transitions are surfaced to the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, task: &Task, status: TaskStatus);
}

/// Rings the terminal bell on stderr and emits a structured log event.
#[derive(Debug, Default)]
pub struct BellNotifier;

impl Notifier for BellNotifier {
    fn notify(&self, task: &Task, status: TaskStatus) {
        use std::io::{IsTerminal, Write};
        let mut stderr = std::io::stderr();
        if stderr.is_terminal() {
            let _ = write!(stderr, "\x07");
            let _ = stderr.flush();
        }
        log::info!(
            "task {} needs attention: {} (workspace {})",
            task.id,
            status,
            task.workspace
        );
    }
}

/// The external collaborators executors are polymorphic over.
#[derive(Clone)]
pub struct Capabilities {
    pub vcs: Arc<dyn VcsRunner>,
    pub forge: Arc<dyn ForgeClient>,
    /// Unset when no agent command is configured; AI steps then fail fast.
    pub agent: Option<Arc<dyn AgentRunner>>,
    pub notifier: Arc<dyn Notifier>,
}

/// What an executor may ask of the world while running one step.
pub struct TaskContext<'a> {
    pub task: &'a mut Task,
    pub workspace: &'a Workspace,
    pub work_dir: &'a Path,
    pub store: &'a Store,
    pub logger: &'a TaskLogger,
    pub config: &'a AtlasConfig,
    pub caps: &'a Capabilities,
    pub cancel: &'a CancelToken,
}

impl TaskContext<'_> {
    /// Save a step artifact under a versioned name, returning the name.
    pub fn save_artifact(&self, filename: &str, bytes: &[u8]) -> Result<String, AtlasError> {
        self.store
            .save_versioned_artifact(&self.task.workspace, &self.task.id, filename, bytes)
    }

    pub fn list_artifacts(&self) -> Result<Vec<String>, AtlasError> {
        self.store
            .list_artifacts(&self.task.workspace, &self.task.id)
    }
}

/// What one step run told the engine to do next.
#[derive(Debug)]
pub enum StepOutcome {
    /// Step finished; metadata is merged into `task.metadata`.
    Success(IndexMap<String, serde_json::Value>),
    /// Sentinel: park the task at `awaiting_approval` without an error.
    Paused,
    /// A failure the resume flow accepts; `status` is one of the
    /// recoverable error statuses.
    Recoverable { status: TaskStatus, reason: String },
    /// The cancel token fired mid-step.
    Cancelled,
}

impl StepOutcome {
    pub fn success() -> Self {
        StepOutcome::Success(IndexMap::new())
    }
}
