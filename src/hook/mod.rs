//! File-backed hook store: the resume oracle and audit trail.
//!
//! Each task has at most one hook, stored as `hook.json` beside the task
//! record with a human-readable `HOOK.md` mirror regenerated on every save.
//! Saves are atomic and never leave the mirror ahead of the journal.

mod markdown;

pub use markdown::render_markdown;

use std::fs;
use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::error::{AtlasError, IoResultExt};
use crate::keys::KeyManager;
use crate::model::{Hook, HookState, ValidationReceipt};
use crate::store::{Store, write_atomic};

/// How long hooks in terminal states are retained before cleanup.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed: Duration,
    pub failed: Duration,
    pub abandoned: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: Duration::days(30),
            failed: Duration::days(7),
            abandoned: Duration::days(7),
        }
    }
}

impl RetentionPolicy {
    /// Retention window for a terminal hook state; `None` for live states.
    pub fn window_for(&self, state: HookState) -> Option<Duration> {
        match state {
            HookState::Completed => Some(self.completed),
            HookState::Failed => Some(self.failed),
            HookState::Abandoned => Some(self.abandoned),
            _ => None,
        }
    }
}

/// Store for per-task hook records.
#[derive(Clone)]
pub struct HookStore {
    store: Store,
    keys: Arc<KeyManager>,
}

impl HookStore {
    pub fn new(store: Store, keys: Arc<KeyManager>) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Initialise a hook in state `initializing` and persist it.
    pub fn create(&self, task_id: &str, workspace: &str) -> Result<Hook, AtlasError> {
        let hook = Hook::new(task_id, workspace);
        self.save(&hook)?;
        Ok(hook)
    }

    pub fn get(&self, workspace: &str, task_id: &str) -> Result<Hook, AtlasError> {
        let path = self.store.home().hook_record_path(workspace, task_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AtlasError::HookNotFound {
                    task_id: task_id.to_string(),
                });
            }
            Err(e) => {
                return Err(AtlasError::Io {
                    context: format!("reading {}", path.display()),
                    source: e,
                });
            }
        };
        let hook: Hook = serde_json::from_slice(&bytes).map_err(|e| AtlasError::Io {
            context: format!("parsing {}", path.display()),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        if hook.task_id != task_id {
            return Err(AtlasError::Io {
                context: format!(
                    "hook at {} belongs to task '{}'",
                    path.display(),
                    hook.task_id
                ),
                source: std::io::Error::from(std::io::ErrorKind::InvalidData),
            });
        }
        Ok(hook)
    }

    /// Load a hook when only the task id is known, scanning workspaces.
    pub fn find(&self, task_id: &str) -> Result<Hook, AtlasError> {
        for workspace in self.store.list_workspaces()? {
            if let Ok(hook) = self.get(&workspace.name, task_id) {
                return Ok(hook);
            }
        }
        Err(AtlasError::HookNotFound {
            task_id: task_id.to_string(),
        })
    }

    /// Atomically persist the hook and regenerate its `HOOK.md` mirror.
    ///
    /// The bounded-list caps are enforced on the way to disk; a caller that
    /// grew the lists past the caps gets the oldest entries evicted.
    pub fn save(&self, hook: &Hook) -> Result<(), AtlasError> {
        if hook.over_caps() {
            let mut capped = hook.clone();
            capped.enforce_caps();
            return self.save(&capped);
        }
        let path = self
            .store
            .home()
            .hook_record_path(&hook.workspace, &hook.task_id);
        let mut bytes = serde_json::to_vec_pretty(hook).map_err(|e| AtlasError::Io {
            context: format!("serializing {}", path.display()),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        bytes.push(b'\n');
        write_atomic(&path, &bytes)?;

        let markdown = render_markdown(hook);
        let md_path = self
            .store
            .home()
            .hook_markdown_path(&hook.workspace, &hook.task_id);
        write_atomic(&md_path, markdown.as_bytes())
    }

    pub fn delete(&self, workspace: &str, task_id: &str) -> Result<(), AtlasError> {
        let path = self.store.home().hook_record_path(workspace, task_id);
        if !path.exists() {
            return Err(AtlasError::HookNotFound {
                task_id: task_id.to_string(),
            });
        }
        fs::remove_file(&path).io_context(format!("removing {}", path.display()))?;
        let md_path = self.store.home().hook_markdown_path(workspace, task_id);
        if md_path.exists() {
            fs::remove_file(&md_path).io_context(format!("removing {}", md_path.display()))?;
        }
        Ok(())
    }

    /// Hooks in a terminal state whose `updated_at` is older than the
    /// retention window for that state.
    pub fn list_stale(&self, retention: &RetentionPolicy) -> Result<Vec<Hook>, AtlasError> {
        let now = Utc::now();
        let mut stale = Vec::new();
        for workspace in self.store.list_workspaces()? {
            for task in self.store.list_tasks(&workspace.name)? {
                let hook = match self.get(&workspace.name, &task.id) {
                    Ok(hook) => hook,
                    Err(AtlasError::HookNotFound { .. }) => continue,
                    Err(e) => return Err(e),
                };
                if let Some(window) = retention.window_for(hook.state)
                    && now - hook.updated_at > window
                {
                    stale.push(hook);
                }
            }
        }
        Ok(stale)
    }

    /// Sign a receipt and append it to the hook. Returns the assigned id.
    ///
    /// The id participates in the canonical form, so signing happens after
    /// the hook assigns it.
    pub fn append_signed_receipt(
        &self,
        hook: &mut Hook,
        mut receipt: ValidationReceipt,
    ) -> String {
        receipt.key_fingerprint = self.keys.fingerprint().to_string();
        receipt.signature = None;
        let stored = hook.add_receipt(receipt);
        let canonical = stored.canonical_form();
        stored.signature = Some(self.keys.sign(canonical.as_bytes()));
        stored.id.clone()
    }

    /// Verify a receipt's signature against the current key.
    pub fn verify_receipt(&self, receipt: &ValidationReceipt) -> Result<(), AtlasError> {
        let signature = receipt.signature.as_deref().ok_or_else(|| {
            AtlasError::ValidationFailed {
                stage: format!("receipt {} (unsigned)", receipt.id),
            }
        })?;
        if receipt.key_fingerprint != self.keys.fingerprint() {
            return Err(AtlasError::ValidationFailed {
                stage: format!(
                    "receipt {} (signed by key {}, current key is {})",
                    receipt.id,
                    receipt.key_fingerprint,
                    self.keys.fingerprint()
                ),
            });
        }
        self.keys
            .verify(receipt.canonical_form().as_bytes(), signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::home::AtlasHome;
    use crate::model::{CheckpointTrigger, TaskTemplate, Workspace};
    use std::path::PathBuf;

    fn harness() -> (tempfile::TempDir, Store, HookStore) {
        let dir = tempfile::tempdir().unwrap();
        let home = AtlasHome::at(dir.path());
        let store = Store::new(home.clone());
        let keys = Arc::new(KeyManager::load_or_create(&home.signing_key_path()).unwrap());
        let hooks = HookStore::new(store.clone(), keys);
        (dir, store, hooks)
    }

    fn seeded_task(store: &Store) -> crate::model::Task {
        store
            .create_workspace(&Workspace::new("auth", "atlas/auth", PathBuf::from("/wt"), PathBuf::from("/repo")))
            .unwrap();
        let task = crate::model::Task::new(
            "auth",
            "add login",
            &TaskTemplate::builtin("feature").unwrap(),
        );
        store.create_task(&task).unwrap();
        task
    }

    fn unsigned_receipt(command: &str, exit_code: i32) -> ValidationReceipt {
        ValidationReceipt {
            id: String::new(),
            step_name: "lint".into(),
            command: command.into(),
            exit_code,
            duration_ms: 42,
            key_fingerprint: String::new(),
            signature: None,
        }
    }

    #[test]
    fn test_create_get_round_trip() {
        let (_dir, store, hooks) = harness();
        let task = seeded_task(&store);
        let hook = hooks.create(&task.id, "auth").unwrap();
        assert_eq!(hook.state, HookState::Initializing);

        let loaded = hooks.get("auth", &task.id).unwrap();
        assert_eq!(loaded, hook);
        assert_eq!(hooks.find(&task.id).unwrap(), hook);
    }

    #[test]
    fn test_missing_hook() {
        let (_dir, store, hooks) = harness();
        seeded_task(&store);
        assert_eq!(
            hooks.get("auth", "t-missing").unwrap_err().kind(),
            "hook_not_found"
        );
    }

    #[test]
    fn test_save_regenerates_markdown_mirror() {
        let (_dir, store, hooks) = harness();
        let task = seeded_task(&store);
        let mut hook = hooks.create(&task.id, "auth").unwrap();
        hook.add_checkpoint(CheckpointTrigger::Manual, Some("before risky step"), None);
        hooks.save(&hook).unwrap();

        let md_path = store.home().hook_markdown_path("auth", &task.id);
        let markdown = fs::read_to_string(md_path).unwrap();
        assert!(markdown.contains("before risky step"));
        assert_eq!(markdown, render_markdown(&hook));
    }

    #[test]
    fn test_signed_receipt_verifies() {
        let (_dir, store, hooks) = harness();
        let task = seeded_task(&store);
        let mut hook = hooks.create(&task.id, "auth").unwrap();

        let id = hooks.append_signed_receipt(&mut hook, unsigned_receipt("cargo clippy", 0));
        assert_eq!(id, "r-1");
        let receipt = hook.receipts.last().unwrap();
        hooks.verify_receipt(receipt).unwrap();

        // Altering any signed field invalidates the signature.
        let mut tampered = receipt.clone();
        tampered.exit_code = 1;
        assert!(hooks.verify_receipt(&tampered).is_err());
        let mut tampered = receipt.clone();
        tampered.command = "cargo clippy --fix".into();
        assert!(hooks.verify_receipt(&tampered).is_err());
    }

    #[test]
    fn test_unsigned_receipt_is_untrusted() {
        let (_dir, store, hooks) = harness();
        let task = seeded_task(&store);
        let mut hook = hooks.create(&task.id, "auth").unwrap();
        let receipt = hook.add_receipt(unsigned_receipt("cargo test", 0)).clone();
        assert!(hooks.verify_receipt(&receipt).is_err());
    }

    #[test]
    fn test_list_stale_respects_per_state_windows() {
        let (_dir, store, hooks) = harness();
        let task = seeded_task(&store);

        let mut hook = hooks.create(&task.id, "auth").unwrap();
        hook.transition(HookState::StepRunning, "step", None).unwrap();
        hook.transition(HookState::Completed, "done", None).unwrap();
        // Backdate past the completed window.
        hook.updated_at = Utc::now() - Duration::days(35);
        hooks.save(&hook).unwrap();

        let stale = hooks.list_stale(&RetentionPolicy::default()).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].task_id, task.id);

        // A fresh completed hook is kept.
        let mut hook = hooks.get("auth", &task.id).unwrap();
        hook.updated_at = Utc::now() - Duration::days(2);
        hooks.save(&hook).unwrap();
        assert!(hooks.list_stale(&RetentionPolicy::default()).unwrap().is_empty());
    }

    #[test]
    fn test_non_terminal_hooks_never_stale() {
        let (_dir, store, hooks) = harness();
        let task = seeded_task(&store);
        let mut hook = hooks.create(&task.id, "auth").unwrap();
        hook.updated_at = Utc::now() - Duration::days(400);
        hooks.save(&hook).unwrap();
        assert!(hooks.list_stale(&RetentionPolicy::default()).unwrap().is_empty());
    }

    #[test]
    fn test_save_enforces_caps() {
        use crate::model::{MAX_CHECKPOINTS, StepCheckpoint};

        let (_dir, store, hooks) = harness();
        let task = seeded_task(&store);
        let mut hook = hooks.create(&task.id, "auth").unwrap();
        // Grow the list directly, bypassing add_checkpoint's own eviction.
        for i in 0..(MAX_CHECKPOINTS + 10) {
            hook.checkpoints.push(StepCheckpoint {
                id: format!("cp-{i}"),
                created_at: Utc::now(),
                description: format!("checkpoint {i}"),
                trigger: CheckpointTrigger::Manual,
                step_name: None,
                step_index: None,
            });
        }
        hooks.save(&hook).unwrap();

        let loaded = hooks.get("auth", &task.id).unwrap();
        assert_eq!(loaded.checkpoints.len(), MAX_CHECKPOINTS);
        assert_eq!(
            loaded.checkpoints.last().unwrap().id,
            format!("cp-{}", MAX_CHECKPOINTS + 9)
        );
    }

    #[test]
    fn test_delete_removes_json_and_mirror() {
        let (_dir, store, hooks) = harness();
        let task = seeded_task(&store);
        let hook = hooks.create(&task.id, "auth").unwrap();
        hooks.save(&hook).unwrap();

        hooks.delete("auth", &task.id).unwrap();
        assert!(!store.home().hook_record_path("auth", &task.id).exists());
        assert!(!store.home().hook_markdown_path("auth", &task.id).exists());
        assert_eq!(
            hooks.delete("auth", &task.id).unwrap_err().kind(),
            "hook_not_found"
        );
    }
}
