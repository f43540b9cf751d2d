//! The `~/.atlas` home directory layout.
//!
//! Every persisted record lives under this tree:
//!
//! ```text
//! <home>/.atlas/
//!   keys/signing.key                       # 0600
//!   workspaces/<name>/workspace.json
//!   workspaces/<name>/tasks/<task-id>/
//!       task.json
//!       hook.json
//!       HOOK.md                            # regeneratable mirror
//!       task.log                           # JSON-lines, append-only
//!       artifacts/*
//! ```

use std::path::{Path, PathBuf};

use crate::error::AtlasError;

/// Resolved base directory for all atlas state.
#[derive(Debug, Clone)]
pub struct AtlasHome {
    root: PathBuf,
}

impl AtlasHome {
    /// Resolve the home directory: `$ATLAS_HOME` if set, else `~/.atlas`.
    pub fn from_env() -> Result<Self, AtlasError> {
        if let Ok(dir) = std::env::var("ATLAS_HOME")
            && !dir.is_empty()
        {
            return Ok(Self {
                root: PathBuf::from(dir),
            });
        }
        let home = dirs::home_dir().ok_or_else(|| AtlasError::Io {
            context: "could not determine home directory".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no home directory"),
        })?;
        Ok(Self {
            root: home.join(".atlas"),
        })
    }

    /// Use an explicit base directory (tests and `--home` overrides).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    pub fn signing_key_path(&self) -> PathBuf {
        self.keys_dir().join("signing.key")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.root.join("workspaces")
    }

    pub fn workspace_dir(&self, name: &str) -> PathBuf {
        self.workspaces_dir().join(name)
    }

    pub fn workspace_record_path(&self, name: &str) -> PathBuf {
        self.workspace_dir(name).join("workspace.json")
    }

    pub fn tasks_dir(&self, workspace: &str) -> PathBuf {
        self.workspace_dir(workspace).join("tasks")
    }

    pub fn task_dir(&self, workspace: &str, task_id: &str) -> PathBuf {
        self.tasks_dir(workspace).join(task_id)
    }

    pub fn task_record_path(&self, workspace: &str, task_id: &str) -> PathBuf {
        self.task_dir(workspace, task_id).join("task.json")
    }

    pub fn hook_record_path(&self, workspace: &str, task_id: &str) -> PathBuf {
        self.task_dir(workspace, task_id).join("hook.json")
    }

    pub fn hook_markdown_path(&self, workspace: &str, task_id: &str) -> PathBuf {
        self.task_dir(workspace, task_id).join("HOOK.md")
    }

    pub fn task_log_path(&self, workspace: &str, task_id: &str) -> PathBuf {
        self.task_dir(workspace, task_id).join("task.log")
    }

    pub fn artifacts_dir(&self, workspace: &str, task_id: &str) -> PathBuf {
        self.task_dir(workspace, task_id).join("artifacts")
    }

    /// Default parent directory for worktrees created by `atlas start`.
    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join("worktrees")
    }
}
