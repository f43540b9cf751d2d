//! Retention-based pruning of stale hooks.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AtlasError;
use crate::hook::{HookStore, RetentionPolicy};
use crate::model::HookState;

/// One hook eligible for deletion.
#[derive(Debug, Clone, Serialize)]
pub struct StaleHook {
    pub workspace: String,
    pub task_id: String,
    pub state: HookState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub candidates: Vec<StaleHook>,
    pub deleted: usize,
    /// Per-hook deletion failures. Partial failure still exits 0; the
    /// warnings carry the details.
    pub warnings: Vec<String>,
}

/// Prune hooks past their retention window. With `dry_run`, report the
/// candidates and delete nothing.
pub fn cleanup_hooks(
    hooks: &HookStore,
    retention: &RetentionPolicy,
    dry_run: bool,
) -> Result<CleanupReport, AtlasError> {
    let stale = hooks.list_stale(retention)?;
    let candidates: Vec<StaleHook> = stale
        .iter()
        .map(|hook| StaleHook {
            workspace: hook.workspace.clone(),
            task_id: hook.task_id.clone(),
            state: hook.state,
            updated_at: hook.updated_at,
        })
        .collect();

    let mut deleted = 0;
    let mut warnings = Vec::new();
    if !dry_run {
        for candidate in &candidates {
            match hooks.delete(&candidate.workspace, &candidate.task_id) {
                Ok(()) => deleted += 1,
                Err(e) => warnings.push(format!(
                    "failed to delete hook for {}/{}: {}",
                    candidate.workspace,
                    candidate.task_id,
                    e.plain_message()
                )),
            }
        }
    }

    Ok(CleanupReport {
        dry_run,
        candidates,
        deleted,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::home::AtlasHome;
    use crate::keys::KeyManager;
    use crate::model::{Hook, Task, TaskTemplate, Workspace};
    use crate::store::Store;
    use chrono::Duration;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn harness() -> (tempfile::TempDir, Store, HookStore) {
        let dir = tempfile::tempdir().unwrap();
        let home = AtlasHome::at(dir.path());
        let store = Store::new(home.clone());
        let keys = Arc::new(KeyManager::load_or_create(&home.signing_key_path()).unwrap());
        let hooks = HookStore::new(store.clone(), keys);
        (dir, store, hooks)
    }

    fn seed_hook(store: &Store, hooks: &HookStore, state: HookState, age_days: i64) -> String {
        let ws_name = "cleanup";
        if !store.workspace_exists(ws_name) {
            store
                .create_workspace(&Workspace::new(
                    ws_name,
                    "atlas/cleanup",
                    PathBuf::from("/wt"),
                    PathBuf::from("/repo"),
                ))
                .unwrap();
        }
        let task = Task::new(ws_name, "old task", &TaskTemplate::builtin("feature").unwrap());
        store.create_task(&task).unwrap();

        let mut hook = Hook::new(&task.id, ws_name);
        hook.state = state;
        hook.updated_at = Utc::now() - Duration::days(age_days);
        hooks.save(&hook).unwrap();
        task.id
    }

    #[test]
    fn test_retention_scenario() {
        let (_dir, store, hooks) = harness();
        seed_hook(&store, &hooks, HookState::Completed, 35);
        seed_hook(&store, &hooks, HookState::Failed, 10);
        seed_hook(&store, &hooks, HookState::Abandoned, 8);
        // Fresh ones are kept.
        seed_hook(&store, &hooks, HookState::Completed, 5);
        seed_hook(&store, &hooks, HookState::Failed, 2);

        let retention = RetentionPolicy::default();

        // Dry run reports exactly the three stale hooks and deletes none.
        let report = cleanup_hooks(&hooks, &retention, true).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.candidates.len(), 3);
        assert_eq!(report.deleted, 0);
        let again = cleanup_hooks(&hooks, &retention, true).unwrap();
        assert_eq!(again.candidates.len(), 3);

        // A real run deletes all three.
        let report = cleanup_hooks(&hooks, &retention, false).unwrap();
        assert_eq!(report.deleted, 3);
        assert!(report.warnings.is_empty());
        let after = cleanup_hooks(&hooks, &retention, false).unwrap();
        assert!(after.candidates.is_empty());
    }

    #[test]
    fn test_live_hooks_never_pruned() {
        let (_dir, store, hooks) = harness();
        seed_hook(&store, &hooks, HookState::StepRunning, 400);
        let report = cleanup_hooks(&hooks, &RetentionPolicy::default(), false).unwrap();
        assert!(report.candidates.is_empty());
        assert_eq!(report.deleted, 0);
    }
}
