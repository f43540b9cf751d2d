//! Atomic, append-aware persistence under the atlas home directory.
//!
//! Record updates go through [`write_atomic`]: write a sibling temp file,
//! fsync it, rename over the target, fsync the parent directory. Readers
//! observe either the old or the new content, never a torn file.
//!
//! The append-only task log takes an exclusive advisory lock per append so
//! concurrent appenders coalesce safely.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{AtlasError, IoResultExt};
use crate::home::AtlasHome;
use crate::model::{Task, Workspace};

/// Atomically replace `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AtlasError> {
    let parent = path.parent().ok_or_else(|| AtlasError::Io {
        context: format!("no parent directory for {}", path.display()),
        source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
    })?;
    fs::create_dir_all(parent).io_context(format!("creating {}", parent.display()))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".atlas-tmp")
        .tempfile_in(parent)
        .io_context(format!("creating temp file in {}", parent.display()))?;
    tmp.write_all(bytes)
        .io_context(format!("writing {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .io_context(format!("syncing {}", path.display()))?;
    tmp.persist(path).map_err(|e| AtlasError::Io {
        context: format!("replacing {}", path.display()),
        source: e.error,
    })?;

    // Make the rename itself durable.
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, AtlasError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(AtlasError::Io {
                context: format!("reading {}", path.display()),
                source: e,
            });
        }
    };
    let value = serde_json::from_slice(&bytes).map_err(|e| AtlasError::Io {
        context: format!("parsing {}", path.display()),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    Ok(Some(value))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), AtlasError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| AtlasError::Io {
        context: format!("serializing {}", path.display()),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// File-backed store for workspace and task records plus per-task
/// auxiliary files (log, artifacts).
#[derive(Debug, Clone)]
pub struct Store {
    home: AtlasHome,
}

impl Store {
    pub fn new(home: AtlasHome) -> Self {
        Self { home }
    }

    pub fn home(&self) -> &AtlasHome {
        &self.home
    }

    // ------------------------------------------------------------------
    // Workspaces
    // ------------------------------------------------------------------

    pub fn workspace_exists(&self, name: &str) -> bool {
        self.home.workspace_record_path(name).is_file()
    }

    pub fn create_workspace(&self, workspace: &Workspace) -> Result<(), AtlasError> {
        if self.workspace_exists(&workspace.name) {
            return Err(AtlasError::InvalidArgument {
                message: format!("workspace '{}' already exists", workspace.name),
            });
        }
        write_json(&self.home.workspace_record_path(&workspace.name), workspace)
    }

    pub fn get_workspace(&self, name: &str) -> Result<Workspace, AtlasError> {
        read_json(&self.home.workspace_record_path(name))?.ok_or_else(|| {
            AtlasError::WorkspaceNotFound {
                name: name.to_string(),
            }
        })
    }

    pub fn update_workspace(&self, workspace: &Workspace) -> Result<(), AtlasError> {
        if !self.workspace_exists(&workspace.name) {
            return Err(AtlasError::WorkspaceNotFound {
                name: workspace.name.clone(),
            });
        }
        write_json(&self.home.workspace_record_path(&workspace.name), workspace)
    }

    pub fn delete_workspace(&self, name: &str) -> Result<(), AtlasError> {
        let dir = self.home.workspace_dir(name);
        if !dir.exists() {
            return Err(AtlasError::WorkspaceNotFound {
                name: name.to_string(),
            });
        }
        fs::remove_dir_all(&dir).io_context(format!("removing {}", dir.display()))
    }

    /// All workspace records, sorted by name.
    pub fn list_workspaces(&self) -> Result<Vec<Workspace>, AtlasError> {
        let dir = self.home.workspaces_dir();
        let mut names = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect::<Vec<_>>(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(AtlasError::Io {
                    context: format!("listing {}", dir.display()),
                    source: e,
                });
            }
        };
        names.sort();
        let mut workspaces = Vec::with_capacity(names.len());
        for name in names {
            // Stray directories without a record are reported, not invented.
            if let Some(ws) = read_json(&self.home.workspace_record_path(&name))? {
                workspaces.push(ws);
            } else {
                log::warn!("workspace directory '{name}' has no workspace.json");
            }
        }
        Ok(workspaces)
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub fn task_exists(&self, workspace: &str, task_id: &str) -> bool {
        self.home.task_record_path(workspace, task_id).is_file()
    }

    pub fn create_task(&self, task: &Task) -> Result<(), AtlasError> {
        if !self.workspace_exists(&task.workspace) {
            return Err(AtlasError::WorkspaceNotFound {
                name: task.workspace.clone(),
            });
        }
        write_json(&self.home.task_record_path(&task.workspace, &task.id), task)
    }

    pub fn get_task(&self, workspace: &str, task_id: &str) -> Result<Task, AtlasError> {
        read_json(&self.home.task_record_path(workspace, task_id))?.ok_or_else(|| {
            AtlasError::TaskNotFound {
                workspace: workspace.to_string(),
                task_id: task_id.to_string(),
            }
        })
    }

    pub fn update_task(&self, task: &Task) -> Result<(), AtlasError> {
        if !self.task_exists(&task.workspace, &task.id) {
            return Err(AtlasError::TaskNotFound {
                workspace: task.workspace.clone(),
                task_id: task.id.clone(),
            });
        }
        write_json(&self.home.task_record_path(&task.workspace, &task.id), task)
    }

    pub fn delete_task(&self, workspace: &str, task_id: &str) -> Result<(), AtlasError> {
        let dir = self.home.task_dir(workspace, task_id);
        if !dir.exists() {
            return Err(AtlasError::TaskNotFound {
                workspace: workspace.to_string(),
                task_id: task_id.to_string(),
            });
        }
        fs::remove_dir_all(&dir).io_context(format!("removing {}", dir.display()))
    }

    /// All task records in a workspace, sorted by creation time.
    pub fn list_tasks(&self, workspace: &str) -> Result<Vec<Task>, AtlasError> {
        if !self.workspace_exists(workspace) {
            return Err(AtlasError::WorkspaceNotFound {
                name: workspace.to_string(),
            });
        }
        let dir = self.home.tasks_dir(workspace);
        let ids = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect::<Vec<_>>(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(AtlasError::Io {
                    context: format!("listing {}", dir.display()),
                    source: e,
                });
            }
        };
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = read_json(&self.home.task_record_path(workspace, &id))? {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a: &Task, b: &Task| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    // ------------------------------------------------------------------
    // Task log and artifacts
    // ------------------------------------------------------------------

    /// Append bytes to the task log without truncation.
    ///
    /// Takes an exclusive advisory lock for the duration of the append so
    /// lines from concurrent writers never interleave.
    pub fn append_log(
        &self,
        workspace: &str,
        task_id: &str,
        bytes: &[u8],
    ) -> Result<(), AtlasError> {
        let path = self.home.task_log_path(workspace, task_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).io_context(format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .io_context(format!("opening {}", path.display()))?;
        file.lock_exclusive()
            .io_context(format!("locking {}", path.display()))?;
        let result = file
            .write_all(bytes)
            .io_context(format!("appending {}", path.display()));
        let _ = fs2::FileExt::unlock(&file);
        result
    }

    pub fn read_log(&self, workspace: &str, task_id: &str) -> Result<String, AtlasError> {
        let path = self.home.task_log_path(workspace, task_id);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(AtlasError::Io {
                context: format!("reading {}", path.display()),
                source: e,
            }),
        }
    }

    /// Overwrite an artifact.
    pub fn save_artifact(
        &self,
        workspace: &str,
        task_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, AtlasError> {
        let path = self.home.artifacts_dir(workspace, task_id).join(filename);
        write_atomic(&path, bytes)?;
        Ok(path)
    }

    /// Write an artifact under a monotone suffix, returning the chosen name.
    ///
    /// `notes.md` becomes `notes.md`, `notes-2.md`, `notes-3.md`, ...
    pub fn save_versioned_artifact(
        &self,
        workspace: &str,
        task_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<String, AtlasError> {
        let dir = self.home.artifacts_dir(workspace, task_id);
        let (stem, ext) = match filename.rsplit_once('.') {
            Some((stem, ext)) => (stem.to_string(), Some(ext.to_string())),
            None => (filename.to_string(), None),
        };
        let mut chosen = filename.to_string();
        let mut version = 1;
        while dir.join(&chosen).exists() {
            version += 1;
            chosen = match &ext {
                Some(ext) => format!("{stem}-{version}.{ext}"),
                None => format!("{stem}-{version}"),
            };
        }
        write_atomic(&dir.join(&chosen), bytes)?;
        Ok(chosen)
    }

    pub fn get_artifact(
        &self,
        workspace: &str,
        task_id: &str,
        filename: &str,
    ) -> Result<Vec<u8>, AtlasError> {
        let path = self.home.artifacts_dir(workspace, task_id).join(filename);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AtlasError::ArtifactNotFound {
                    name: filename.to_string(),
                })
            }
            Err(e) => Err(AtlasError::Io {
                context: format!("reading {}", path.display()),
                source: e,
            }),
        }
    }

    pub fn list_artifacts(
        &self,
        workspace: &str,
        task_id: &str,
    ) -> Result<Vec<String>, AtlasError> {
        let dir = self.home.artifacts_dir(workspace, task_id);
        let mut names = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect::<Vec<_>>(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(AtlasError::Io {
                    context: format!("listing {}", dir.display()),
                    source: e,
                });
            }
        };
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskStatus, TaskTemplate};
    use std::path::PathBuf;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(AtlasHome::at(dir.path()));
        (dir, store)
    }

    fn seeded_workspace(store: &Store) -> Workspace {
        let ws = Workspace::new("auth", "atlas/auth", PathBuf::from("/tmp/wt/auth"), PathBuf::from("/tmp/repo"));
        store.create_workspace(&ws).unwrap();
        ws
    }

    #[test]
    fn test_workspace_crud() {
        let (_dir, store) = test_store();
        let mut ws = seeded_workspace(&store);

        assert!(store.workspace_exists("auth"));
        assert_eq!(store.get_workspace("auth").unwrap(), ws);

        ws.upsert_task_ref("t-1", TaskStatus::Running);
        store.update_workspace(&ws).unwrap();
        assert_eq!(store.get_workspace("auth").unwrap().tasks.len(), 1);

        store.delete_workspace("auth").unwrap();
        assert!(!store.workspace_exists("auth"));
        assert_eq!(
            store.get_workspace("auth").unwrap_err().kind(),
            "workspace_not_found"
        );
    }

    #[test]
    fn test_duplicate_workspace_rejected() {
        let (_dir, store) = test_store();
        seeded_workspace(&store);
        let ws = Workspace::new("auth", "atlas/auth-2", PathBuf::from("/elsewhere"), PathBuf::from("/repo"));
        assert_eq!(
            store.create_workspace(&ws).unwrap_err().kind(),
            "invalid_argument"
        );
    }

    #[test]
    fn test_task_crud_requires_workspace() {
        let (_dir, store) = test_store();
        let template = TaskTemplate::builtin("feature").unwrap();
        let task = Task::new("auth", "add login", &template);
        assert_eq!(
            store.create_task(&task).unwrap_err().kind(),
            "workspace_not_found"
        );

        seeded_workspace(&store);
        store.create_task(&task).unwrap();
        let loaded = store.get_task("auth", &task.id).unwrap();
        assert_eq!(loaded, task);

        let listed = store.list_tasks("auth").unwrap();
        assert_eq!(listed.len(), 1);

        store.delete_task("auth", &task.id).unwrap();
        assert_eq!(
            store.get_task("auth", &task.id).unwrap_err().kind(),
            "task_not_found"
        );
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".atlas-tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_log_append_accumulates() {
        let (_dir, store) = test_store();
        seeded_workspace(&store);
        store.append_log("auth", "t-1", b"{\"event\":\"a\"}\n").unwrap();
        store.append_log("auth", "t-1", b"{\"event\":\"b\"}\n").unwrap();
        let log = store.read_log("auth", "t-1").unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[test]
    fn test_versioned_artifacts_get_monotone_suffix() {
        let (_dir, store) = test_store();
        seeded_workspace(&store);
        let first = store
            .save_versioned_artifact("auth", "t-1", "notes.md", b"one")
            .unwrap();
        let second = store
            .save_versioned_artifact("auth", "t-1", "notes.md", b"two")
            .unwrap();
        let third = store
            .save_versioned_artifact("auth", "t-1", "notes.md", b"three")
            .unwrap();
        assert_eq!(first, "notes.md");
        assert_eq!(second, "notes-2.md");
        assert_eq!(third, "notes-3.md");
        assert_eq!(
            store.get_artifact("auth", "t-1", "notes-2.md").unwrap(),
            b"two"
        );
        assert_eq!(
            store.list_artifacts("auth", "t-1").unwrap(),
            vec!["notes-2.md", "notes-3.md", "notes.md"]
        );
    }

    #[test]
    fn test_missing_artifact_error() {
        let (_dir, store) = test_store();
        seeded_workspace(&store);
        assert_eq!(
            store
                .get_artifact("auth", "t-1", "nope.md")
                .unwrap_err()
                .kind(),
            "artifact_not_found"
        );
    }
}
