//! Shared test harness: an isolated atlas home plus stub collaborators.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rstest::fixture;

use ::atlas::agent::AgentRunner;
use ::atlas::config::AtlasConfig;
use ::atlas::engine::{Capabilities, Notifier, TaskEngine};
use ::atlas::error::AtlasError;
use ::atlas::forge::{CiOutcome, ForgeClient};
use ::atlas::home::AtlasHome;
use ::atlas::hook::HookStore;
use ::atlas::keys::KeyManager;
use ::atlas::model::{Task, TaskStatus, TaskTemplate, Workspace};
use ::atlas::store::Store;
use ::atlas::validate::SharedWriter;
use ::atlas::vcs::VcsRunner;

/// Agent stub that records every prompt it receives.
#[derive(Default)]
pub struct RecordingAgent {
    pub prompts: Mutex<Vec<String>>,
}

impl AgentRunner for RecordingAgent {
    fn run(
        &self,
        prompt: &str,
        _work_dir: &Path,
        _live: Option<SharedWriter>,
    ) -> Result<String, AtlasError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok("made the change".into())
    }
}

#[derive(Default)]
pub struct TestVcs;

impl VcsRunner for TestVcs {
    fn branch_exists(&self, _repo: &Path, _branch: &str) -> bool {
        true
    }
    fn worktree_add(
        &self,
        _repo: &Path,
        path: &Path,
        _branch: &str,
        _base: &str,
    ) -> Result<(), AtlasError> {
        std::fs::create_dir_all(path).unwrap();
        Ok(())
    }
    fn worktree_remove(&self, _repo: &Path, path: &Path, _force: bool) -> Result<(), AtlasError> {
        let _ = std::fs::remove_dir_all(path);
        Ok(())
    }
    fn stage_all(&self, _dir: &Path) -> Result<(), AtlasError> {
        Ok(())
    }
    fn has_staged_changes(&self, _dir: &Path) -> Result<bool, AtlasError> {
        Ok(true)
    }
    fn staged_diff(&self, _dir: &Path) -> Result<String, AtlasError> {
        Ok("diff --git a/lib.rs b/lib.rs".into())
    }
    fn commit(&self, _dir: &Path, _message: &str) -> Result<(), AtlasError> {
        Ok(())
    }
    fn push(&self, _dir: &Path, _branch: &str) -> Result<(), AtlasError> {
        Ok(())
    }
    fn recent_commits(&self, _dir: &Path, _count: usize) -> Result<Vec<String>, AtlasError> {
        Ok(vec!["initial commit".into()])
    }
    fn branch_diff(&self, _dir: &Path, _base: &str) -> Result<String, AtlasError> {
        Ok(String::new())
    }
}

pub struct TestForge;

impl ForgeClient for TestForge {
    fn create_pr(
        &self,
        _dir: &Path,
        _title: &str,
        _body: &str,
        _base: &str,
    ) -> Result<String, AtlasError> {
        Ok("https://example.test/pr/42".into())
    }
    fn ci_status(&self, _dir: &Path, _branch: &str) -> Result<CiOutcome, AtlasError> {
        Ok(CiOutcome::Passing)
    }
}

pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn notify(&self, _task: &Task, _status: TaskStatus) {}
}

/// Fresh isolated atlas home per test.
#[fixture]
pub fn atlas() -> TestAtlas {
    TestAtlas::new()
}

/// An isolated atlas home with stores and a passing validation config.
pub struct TestAtlas {
    pub dir: tempfile::TempDir,
    pub store: Store,
    pub hooks: HookStore,
    pub config: AtlasConfig,
    pub agent: Arc<RecordingAgent>,
}

impl TestAtlas {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let home = AtlasHome::at(dir.path());
        let store = Store::new(home.clone());
        let keys = Arc::new(KeyManager::load_or_create(&home.signing_key_path()).unwrap());
        let hooks = HookStore::new(store.clone(), keys);

        let mut config = AtlasConfig::default();
        config.validation.format = vec!["true".into()];
        config.validation.lint = vec!["true".into()];
        config.validation.test = vec!["true".into()];

        Self {
            dir,
            store,
            hooks,
            config,
            agent: Arc::new(RecordingAgent::default()),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            vcs: Arc::new(TestVcs),
            forge: Arc::new(TestForge),
            agent: Some(self.agent.clone()),
            notifier: Arc::new(SilentNotifier),
        }
    }

    pub fn engine(&self) -> TaskEngine {
        TaskEngine::new(
            self.store.clone(),
            self.hooks.clone(),
            self.config.clone(),
            self.capabilities(),
        )
    }

    /// Seed a workspace whose worktree is a real temp directory.
    pub fn seed_workspace(&self, name: &str) -> Workspace {
        let worktree = self.dir.path().join("worktrees").join(name);
        std::fs::create_dir_all(&worktree).unwrap();
        let workspace = Workspace::new(
            name,
            &format!("atlas/{name}"),
            worktree,
            PathBuf::from("/repo"),
        );
        self.store.create_workspace(&workspace).unwrap();
        workspace
    }

    pub fn seed_task(&self, workspace: &str, template_name: &str) -> Task {
        let template = TaskTemplate::builtin(template_name).unwrap();
        let task = Task::new(workspace, "add login flow", &template);
        self.store.create_task(&task).unwrap();
        task
    }
}
