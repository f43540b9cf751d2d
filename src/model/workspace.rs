//! Workspace records: a named checkout bound to a branch plus task history.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{SCHEMA_VERSION, TaskStatus};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    Paused,
    Closed,
    /// History preserved, worktree removed.
    Retired,
}

/// Lightweight task reference held on the workspace record.
///
/// The task store holds the authoritative record; this keeps
/// `workspace.json` small and cycle-free.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub schema_version: u32,
    /// Filesystem-safe name; doubles as the directory name under `workspaces/`.
    pub name: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    /// The repository the worktree belongs to; worktree cleanup runs here.
    pub repo_root: PathBuf,
    pub status: WorkspaceStatus,
    #[serde(default)]
    pub tasks: Vec<TaskRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(name: &str, branch: &str, worktree_path: PathBuf, repo_root: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            name: name.to_string(),
            branch: branch.to_string(),
            worktree_path,
            repo_root,
            status: WorkspaceStatus::Active,
            tasks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Record or refresh a task reference.
    pub fn upsert_task_ref(&mut self, id: &str, status: TaskStatus) {
        match self.tasks.iter_mut().find(|t| t.id == id) {
            Some(entry) => entry.status = status,
            None => self.tasks.push(TaskRef {
                id: id.to_string(),
                status,
            }),
        }
        self.updated_at = Utc::now();
    }

    /// Task references not yet in a terminal status.
    pub fn non_terminal_tasks(&self) -> impl Iterator<Item = &TaskRef> {
        self.tasks.iter().filter(|t| !t.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_replaces_status() {
        let mut ws = Workspace::new("auth", "atlas/auth", PathBuf::from("/tmp/wt/auth"), PathBuf::from("/tmp/repo"));
        ws.upsert_task_ref("t-1", TaskStatus::Running);
        ws.upsert_task_ref("t-1", TaskStatus::Completed);
        ws.upsert_task_ref("t-2", TaskStatus::Pending);

        assert_eq!(ws.tasks.len(), 2);
        assert_eq!(ws.tasks[0].status, TaskStatus::Completed);
        let open: Vec<_> = ws.non_terminal_tasks().map(|t| t.id.as_str()).collect();
        assert_eq!(open, vec!["t-2"]);
    }

    #[test]
    fn test_workspace_round_trips_through_json() {
        let ws = Workspace::new("auth", "atlas/auth", PathBuf::from("/tmp/wt/auth"), PathBuf::from("/tmp/repo"));
        let json = serde_json::to_string(&ws).unwrap();
        let parsed: Workspace = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ws);
        assert!(json.contains("\"status\":\"active\""));
    }
}
