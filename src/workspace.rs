//! Workspace life-cycle: isolated checkouts bound to a branch and a task
//! history.
//!
//! The manager stays usable when the worktree cannot be located: state
//! updates succeed and the cleanup problem is reported, never silently
//! reconciled.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use crate::error::AtlasError;
use crate::model::{Workspace, WorkspaceStatus};
use crate::store::Store;
use crate::vcs::VcsRunner;

/// A workspace row with its record/filesystem divergence, if any.
#[derive(Debug)]
pub struct WorkspaceEntry {
    pub workspace: Workspace,
    pub divergence: Option<String>,
}

/// Result of a retire or destroy: the updated record plus any cleanup
/// problems that were reported rather than fixed.
#[derive(Debug)]
pub struct LifecycleOutcome {
    pub workspace: Workspace,
    pub warnings: Vec<String>,
}

pub struct WorkspaceManager {
    store: Store,
    vcs: Arc<dyn VcsRunner>,
}

impl WorkspaceManager {
    pub fn new(store: Store, vcs: Arc<dyn VcsRunner>) -> Self {
        Self { store, vcs }
    }

    /// Create a workspace: a branch, a worktree, and the persisted record.
    pub fn create(
        &self,
        name: &str,
        branch: &str,
        base_branch: &str,
        repo_root: &Path,
    ) -> Result<Workspace, AtlasError> {
        validate_name(name)?;
        if self.store.workspace_exists(name) {
            return Err(AtlasError::InvalidArgument {
                message: format!("workspace '{name}' already exists"),
            });
        }

        let worktree_path = self.store.home().worktrees_dir().join(name);
        self.vcs
            .worktree_add(repo_root, &worktree_path, branch, base_branch)?;

        let workspace = Workspace::new(name, branch, worktree_path, repo_root.to_path_buf());
        self.store.create_workspace(&workspace)?;
        Ok(workspace)
    }

    pub fn get(&self, name: &str) -> Result<Workspace, AtlasError> {
        self.store.get_workspace(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.store.workspace_exists(name)
    }

    /// All workspaces with their divergence reports.
    pub fn list(&self) -> Result<Vec<WorkspaceEntry>, AtlasError> {
        Ok(self
            .store
            .list_workspaces()?
            .into_iter()
            .map(|workspace| {
                let divergence = divergence(&workspace);
                WorkspaceEntry {
                    workspace,
                    divergence,
                }
            })
            .collect())
    }

    pub fn close(&self, name: &str) -> Result<Workspace, AtlasError> {
        let mut workspace = self.store.get_workspace(name)?;
        match workspace.status {
            WorkspaceStatus::Closed => Ok(workspace),
            WorkspaceStatus::Retired => Err(AtlasError::InvalidArgument {
                message: format!("workspace '{name}' is retired and cannot be closed"),
            }),
            WorkspaceStatus::Active | WorkspaceStatus::Paused => {
                workspace.status = WorkspaceStatus::Closed;
                workspace.updated_at = Utc::now();
                self.store.update_workspace(&workspace)?;
                Ok(workspace)
            }
        }
    }

    /// Re-activate a closed workspace.
    pub fn reopen(&self, name: &str) -> Result<Workspace, AtlasError> {
        let mut workspace = self.store.get_workspace(name)?;
        match workspace.status {
            WorkspaceStatus::Active => Ok(workspace),
            WorkspaceStatus::Retired => Err(AtlasError::InvalidArgument {
                message: format!(
                    "workspace '{name}' is retired; its worktree is gone and cannot be reopened"
                ),
            }),
            WorkspaceStatus::Closed | WorkspaceStatus::Paused => {
                workspace.status = WorkspaceStatus::Active;
                workspace.updated_at = Utc::now();
                self.store.update_workspace(&workspace)?;
                Ok(workspace)
            }
        }
    }

    /// Retire: preserve history, remove the worktree.
    ///
    /// Idempotent - retiring an already-retired workspace returns the record
    /// and performs no filesystem action. Refuses while any task is
    /// non-terminal.
    pub fn retire(&self, name: &str) -> Result<LifecycleOutcome, AtlasError> {
        let mut workspace = self.store.get_workspace(name)?;
        if workspace.status == WorkspaceStatus::Retired {
            return Ok(LifecycleOutcome {
                workspace,
                warnings: Vec::new(),
            });
        }
        if workspace.non_terminal_tasks().next().is_some() {
            return Err(AtlasError::WorkspaceHasRunningTasks {
                name: name.to_string(),
            });
        }

        let warnings = self.remove_worktree(&workspace);
        workspace.status = WorkspaceStatus::Retired;
        workspace.updated_at = Utc::now();
        self.store.update_workspace(&workspace)?;
        Ok(LifecycleOutcome {
            workspace,
            warnings,
        })
    }

    /// Destroy: remove the worktree and delete every record.
    ///
    /// Confirmation is the CLI's responsibility.
    pub fn destroy(&self, name: &str) -> Result<Vec<String>, AtlasError> {
        let workspace = self.store.get_workspace(name)?;
        let warnings = self.remove_worktree(&workspace);
        self.store.delete_workspace(name)?;
        Ok(warnings)
    }

    /// Best-effort worktree removal; failures become warnings so state
    /// updates still go through (degraded mode).
    fn remove_worktree(&self, workspace: &Workspace) -> Vec<String> {
        let mut warnings = Vec::new();
        if workspace.worktree_path.exists() {
            if let Err(e) =
                self.vcs
                    .worktree_remove(&workspace.repo_root, &workspace.worktree_path, true)
            {
                warnings.push(format!(
                    "could not remove worktree {}: {}",
                    workspace.worktree_path.display(),
                    e.plain_message()
                ));
            }
        } else {
            warnings.push(format!(
                "worktree {} already absent",
                workspace.worktree_path.display()
            ));
        }
        warnings
    }
}

/// The record and the filesystem must agree; divergence is reported.
fn divergence(workspace: &Workspace) -> Option<String> {
    let on_disk = workspace.worktree_path.exists();
    match workspace.status {
        WorkspaceStatus::Retired if on_disk => Some(format!(
            "retired but worktree still present at {}",
            workspace.worktree_path.display()
        )),
        WorkspaceStatus::Active | WorkspaceStatus::Paused | WorkspaceStatus::Closed
            if !on_disk =>
        {
            Some(format!(
                "worktree missing from {}",
                workspace.worktree_path.display()
            ))
        }
        _ => None,
    }
}

fn validate_name(name: &str) -> Result<(), AtlasError> {
    if name.is_empty() {
        return Err(AtlasError::EmptyValue {
            field: "workspace name".into(),
        });
    }
    if sanitize_filename::sanitize(name) != name {
        return Err(AtlasError::InvalidArgument {
            message: format!("workspace name '{name}' is not filesystem-safe"),
        });
    }
    Ok(())
}
