//! The human-in-the-loop transition out of `awaiting_approval`.
//!
//! Approval completes the task; rejection either rewinds it for another
//! attempt (with mandatory feedback) or marks it rejected while preserving
//! the branch and worktree for manual work.

use chrono::{SecondsFormat, Utc};
use serde_json::json;

use crate::error::AtlasError;
use crate::hook::HookStore;
use crate::model::{HookState, Task, TaskStatus, Workspace, WorkspaceStatus};
use crate::store::Store;

/// Actions offered by the approval menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    ApproveAndClose,
    ViewDiff,
    ViewLogs,
    OpenPr,
    Reject,
    Cancel,
}

/// Step names that mark the default rejection resume point.
const IMPLEMENTATION_MARKERS: [&str; 4] = ["implement", "implementation", "code", "develop"];

/// What an approve/reject did, for rendering.
#[derive(Debug)]
pub struct ApprovalReport {
    pub workspace: String,
    pub task_id: String,
    pub status: TaskStatus,
    /// True when the call was an idempotent no-op.
    pub already_done: bool,
}

pub struct ApprovalFlow {
    store: Store,
    hooks: HookStore,
}

impl ApprovalFlow {
    pub fn new(store: Store, hooks: HookStore) -> Self {
        Self { store, hooks }
    }

    /// Locate the parked task.
    ///
    /// Without a workspace argument this succeeds only when exactly one task
    /// anywhere is `awaiting_approval`; with several, non-interactive
    /// callers get `interactive_required`.
    pub fn find_awaiting(
        &self,
        workspace: Option<&str>,
    ) -> Result<(Workspace, Task), AtlasError> {
        match workspace {
            Some(name) => {
                let workspace = self.store.get_workspace(name)?;
                let mut awaiting: Vec<Task> = self
                    .store
                    .list_tasks(name)?
                    .into_iter()
                    .filter(|t| t.status == TaskStatus::AwaitingApproval)
                    .collect();
                match awaiting.len() {
                    0 => Err(AtlasError::NoTasksFound {
                        workspace: Some(name.to_string()),
                    }),
                    // Most recently updated wins when several are parked.
                    _ => {
                        awaiting.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
                        Ok((workspace, awaiting.pop().expect("non-empty")))
                    }
                }
            }
            None => {
                let mut found = Vec::new();
                for workspace in self.store.list_workspaces()? {
                    for task in self.store.list_tasks(&workspace.name)? {
                        if task.status == TaskStatus::AwaitingApproval {
                            found.push((workspace.clone(), task));
                        }
                    }
                }
                match found.len() {
                    0 => Err(AtlasError::NoTasksFound { workspace: None }),
                    1 => Ok(found.pop().expect("non-empty")),
                    n => Err(AtlasError::InteractiveRequired {
                        message: format!(
                            "{n} tasks are awaiting approval; specify a workspace"
                        ),
                    }),
                }
            }
        }
    }

    /// Approve: `awaiting_approval -> completed`, reason `"User approved"`.
    ///
    /// Approving a task that is already completed is a no-op that returns
    /// success and appends nothing.
    pub fn approve(
        &self,
        workspace: &Workspace,
        task: &Task,
        close_workspace: bool,
    ) -> Result<ApprovalReport, AtlasError> {
        let mut task = self.store.get_task(&workspace.name, &task.id)?;

        if task.status == TaskStatus::Completed {
            return Ok(ApprovalReport {
                workspace: workspace.name.clone(),
                task_id: task.id,
                status: TaskStatus::Completed,
                already_done: true,
            });
        }

        if close_workspace {
            // A strict read: refuse the close while any other task of the
            // workspace is non-terminal.
            let workspace = self.store.get_workspace(&workspace.name)?;
            let blocking = workspace
                .non_terminal_tasks()
                .any(|t| t.id != task.id);
            if blocking {
                return Err(AtlasError::WorkspaceHasRunningTasks {
                    name: workspace.name.clone(),
                });
            }
        }

        task.transition(TaskStatus::Completed, "User approved")?;
        if let Some(step) = task.steps.last_mut()
            && step.completed_at.is_none()
        {
            step.completed_at = Some(Utc::now());
        }
        self.store.update_task(&task)?;
        self.finish_hook(&workspace.name, &task.id, HookState::Completed)?;
        self.sync_workspace_ref(&task)?;

        if close_workspace {
            let mut workspace = self.store.get_workspace(&workspace.name)?;
            workspace.status = WorkspaceStatus::Closed;
            workspace.updated_at = Utc::now();
            self.store.update_workspace(&workspace)?;
        }

        Ok(ApprovalReport {
            workspace: workspace.name.clone(),
            task_id: task.id,
            status: TaskStatus::Completed,
            already_done: false,
        })
    }

    /// Reject and retry: capture feedback, rewind to the chosen step, and
    /// put the task back to `running` for the engine to drive.
    ///
    /// `resume_step` is the 1-based step number from the CLI; the default is
    /// the first implementation-flavored step.
    pub fn reject_retry(
        &self,
        workspace: &Workspace,
        task: &Task,
        feedback: &str,
        resume_step: Option<usize>,
    ) -> Result<ApprovalReport, AtlasError> {
        if feedback.trim().is_empty() {
            return Err(AtlasError::EmptyValue {
                field: "feedback".into(),
            });
        }
        let mut task = self.store.get_task(&workspace.name, &task.id)?;

        let resume_index = match resume_step {
            Some(step) => {
                if step == 0 || step > task.steps.len() {
                    return Err(AtlasError::InvalidArgument {
                        message: format!(
                            "step {} out of range (task has {} steps)",
                            step,
                            task.steps.len()
                        ),
                    });
                }
                step - 1
            }
            None => default_resume_index(&task),
        };

        let artifact = format!(
            "# Rejection Feedback\n\nDate: {}\nResume From: Step {}\n\n## Feedback\n\n{}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            resume_index + 1,
            feedback.trim()
        );
        self.store.save_artifact(
            &workspace.name,
            &task.id,
            "rejection-feedback.md",
            artifact.as_bytes(),
        )?;

        task.metadata
            .insert("rejection_feedback".into(), json!(feedback.trim()));
        task.metadata
            .insert("resume_from_step".into(), json!(resume_index));

        // Rewind: steps from the resume point run again.
        task.current_step = resume_index;
        for step in &mut task.steps[resume_index..] {
            step.completed_at = None;
        }
        task.transition(TaskStatus::Running, "User rejected with feedback")?;
        self.store.update_task(&task)?;

        let mut hook = self.hooks.get(&workspace.name, &task.id)?;
        if hook.state == HookState::StepWaiting {
            hook.transition(HookState::StepRunning, "input supplied", None)?;
        }
        self.hooks.save(&hook)?;
        self.sync_workspace_ref(&task)?;

        Ok(ApprovalReport {
            workspace: workspace.name.clone(),
            task_id: task.id,
            status: TaskStatus::Running,
            already_done: false,
        })
    }

    /// Reject (done): mark rejected, preserve branch and worktree.
    pub fn reject_done(
        &self,
        workspace: &Workspace,
        task: &Task,
    ) -> Result<ApprovalReport, AtlasError> {
        let mut task = self.store.get_task(&workspace.name, &task.id)?;
        if task.status == TaskStatus::Rejected {
            return Ok(ApprovalReport {
                workspace: workspace.name.clone(),
                task_id: task.id,
                status: TaskStatus::Rejected,
                already_done: true,
            });
        }
        task.transition(TaskStatus::Rejected, "User rejected")?;
        self.store.update_task(&task)?;
        self.finish_hook(&workspace.name, &task.id, HookState::Abandoned)?;
        self.sync_workspace_ref(&task)?;
        // Workspace status is deliberately unchanged.
        Ok(ApprovalReport {
            workspace: workspace.name.clone(),
            task_id: task.id,
            status: TaskStatus::Rejected,
            already_done: false,
        })
    }

    /// Abandon the workspace's non-terminal task.
    pub fn abandon(&self, workspace_name: &str) -> Result<ApprovalReport, AtlasError> {
        let workspace = self.store.get_workspace(workspace_name)?;
        let task = self
            .store
            .list_tasks(workspace_name)?
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .max_by_key(|t| t.updated_at)
            .ok_or(AtlasError::NoTasksFound {
                workspace: Some(workspace_name.to_string()),
            })?;

        let mut task = self.store.get_task(&workspace.name, &task.id)?;
        // Statuses without a direct edge to `abandoned` route through
        // `running`, which every non-terminal status may re-enter.
        if !task.status.can_transition_to(TaskStatus::Abandoned) {
            task.transition(TaskStatus::Running, "Abandoning")?;
        }
        task.transition(TaskStatus::Abandoned, "User abandoned task")?;
        self.store.update_task(&task)?;
        self.finish_hook(&workspace.name, &task.id, HookState::Abandoned)?;
        self.sync_workspace_ref(&task)?;

        Ok(ApprovalReport {
            workspace: workspace.name.clone(),
            task_id: task.id,
            status: TaskStatus::Abandoned,
            already_done: false,
        })
    }

    /// Drive the hook to its terminal state for this flow.
    fn finish_hook(
        &self,
        workspace: &str,
        task_id: &str,
        terminal: HookState,
    ) -> Result<(), AtlasError> {
        let mut hook = match self.hooks.get(workspace, task_id) {
            Ok(hook) => hook,
            // Tasks that predate hook support have nothing to finish.
            Err(AtlasError::HookNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        if hook.state.is_terminal() {
            return Ok(());
        }
        match terminal {
            HookState::Completed => {
                if hook.state == HookState::StepWaiting {
                    hook.transition(HookState::StepRunning, "input supplied", None)?;
                }
                hook.transition(HookState::Completed, "last step succeeded", None)?;
            }
            HookState::Abandoned => {
                hook.transition(HookState::Abandoned, "user abandons task", None)?;
            }
            other => {
                hook.transition(other, "flow finished", None)?;
            }
        }
        hook.current_step = None;
        self.hooks.save(&hook)
    }

    fn sync_workspace_ref(&self, task: &Task) -> Result<(), AtlasError> {
        let mut workspace = self.store.get_workspace(&task.workspace)?;
        workspace.upsert_task_ref(&task.id, task.status);
        self.store.update_workspace(&workspace)
    }
}

/// First implementation-flavored step, else step 0.
fn default_resume_index(task: &Task) -> usize {
    task.steps
        .iter()
        .position(|step| {
            let name = step.name.to_lowercase();
            IMPLEMENTATION_MARKERS
                .iter()
                .any(|marker| name.contains(marker))
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::home::AtlasHome;
    use crate::keys::KeyManager;
    use crate::model::{CheckpointTrigger, Hook, TaskTemplate};
    use std::path::PathBuf;
    use std::sync::Arc;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Store,
        hooks: HookStore,
        flow: ApprovalFlow,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let home = AtlasHome::at(dir.path());
            let store = Store::new(home.clone());
            let keys = Arc::new(KeyManager::load_or_create(&home.signing_key_path()).unwrap());
            let hooks = HookStore::new(store.clone(), keys);
            let flow = ApprovalFlow::new(store.clone(), hooks.clone());
            Self {
                _dir: dir,
                store,
                hooks,
                flow,
            }
        }

        /// Seed a workspace with one task parked at the approval gate.
        fn seed_parked(&self, workspace: &str) -> (Workspace, Task) {
            let ws = Workspace::new(
                workspace,
                &format!("atlas/{workspace}"),
                PathBuf::from(format!("/wt/{workspace}")),
                PathBuf::from("/repo"),
            );
            self.store.create_workspace(&ws).unwrap();

            let mut task = Task::new(workspace, "add login flow", &TaskTemplate::builtin("feature").unwrap());
            task.transition(TaskStatus::Running, "Task started").unwrap();
            for i in 0..task.steps.len() - 1 {
                task.steps[i].completed_at = Some(Utc::now());
                task.steps[i].attempts = 1;
            }
            task.current_step = task.steps.len() - 1;
            task.transition(TaskStatus::AwaitingApproval, "Awaiting user approval")
                .unwrap();
            self.store.create_task(&task).unwrap();

            let mut hook = Hook::new(&task.id, workspace);
            hook.transition(HookState::StepRunning, "engine begins a step", None)
                .unwrap();
            hook.add_checkpoint(CheckpointTrigger::StepComplete, None, Some(("implement", 0)));
            hook.transition(HookState::StepWaiting, "step requests approval", None)
                .unwrap();
            self.hooks.save(&hook).unwrap();

            let mut ws = self.store.get_workspace(workspace).unwrap();
            ws.upsert_task_ref(&task.id, task.status);
            self.store.update_workspace(&ws).unwrap();

            (self.store.get_workspace(workspace).unwrap(), task)
        }
    }

    #[test]
    fn test_find_awaiting_single_task_no_workspace_needed() {
        let harness = Harness::new();
        let (_, task) = harness.seed_parked("auth");
        let (ws, found) = harness.flow.find_awaiting(None).unwrap();
        assert_eq!(ws.name, "auth");
        assert_eq!(found.id, task.id);
    }

    #[test]
    fn test_find_awaiting_multiple_requires_workspace() {
        let harness = Harness::new();
        harness.seed_parked("auth");
        harness.seed_parked("billing");

        let err = harness.flow.find_awaiting(None).unwrap_err();
        assert_eq!(err.kind(), "interactive_required");
        assert_eq!(err.exit_code(), 2);

        // Naming the workspace resolves it.
        let (ws, _) = harness.flow.find_awaiting(Some("billing")).unwrap();
        assert_eq!(ws.name, "billing");
    }

    #[test]
    fn test_find_awaiting_none() {
        let harness = Harness::new();
        let err = harness.flow.find_awaiting(None).unwrap_err();
        assert_eq!(err.kind(), "no_tasks_found");
    }

    #[test]
    fn test_approve_completes_task() {
        let harness = Harness::new();
        let (ws, task) = harness.seed_parked("auth");

        let report = harness.flow.approve(&ws, &task, false).unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        assert!(!report.already_done);

        let task = harness.store.get_task("auth", &task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.current_step, task.steps.len());
        let last = task.transitions.last().unwrap();
        assert_eq!(last.reason, "User approved");

        let hook = harness.hooks.get("auth", &task.id).unwrap();
        assert_eq!(hook.state, HookState::Completed);
    }

    #[test]
    fn test_approve_is_idempotent() {
        let harness = Harness::new();
        let (ws, task) = harness.seed_parked("auth");
        harness.flow.approve(&ws, &task, false).unwrap();
        let before = harness.store.get_task("auth", &task.id).unwrap();

        let report = harness.flow.approve(&ws, &task, false).unwrap();
        assert!(report.already_done);
        let after = harness.store.get_task("auth", &task.id).unwrap();
        // No transition appended.
        assert_eq!(before.transitions.len(), after.transitions.len());
    }

    #[test]
    fn test_approve_and_close_refuses_other_running_tasks() {
        let harness = Harness::new();
        let (_, task) = harness.seed_parked("auth");
        let mut ws = harness.store.get_workspace("auth").unwrap();
        ws.upsert_task_ref("t-other", TaskStatus::Running);
        harness.store.update_workspace(&ws).unwrap();

        let err = harness.flow.approve(&ws, &task, true).unwrap_err();
        assert_eq!(err.kind(), "workspace_has_running_tasks");

        // Without --close the approval goes through.
        harness.flow.approve(&ws, &task, false).unwrap();
    }

    #[test]
    fn test_approve_and_close_closes_workspace() {
        let harness = Harness::new();
        let (ws, task) = harness.seed_parked("auth");
        harness.flow.approve(&ws, &task, true).unwrap();
        let ws = harness.store.get_workspace("auth").unwrap();
        assert_eq!(ws.status, WorkspaceStatus::Closed);
    }

    #[test]
    fn test_reject_retry_scenario() {
        let harness = Harness::new();
        let (ws, task) = harness.seed_parked("auth");

        let report = harness
            .flow
            .reject_retry(&ws, &task, "Fix auth flow", Some(3))
            .unwrap();
        assert_eq!(report.status, TaskStatus::Running);

        let task = harness.store.get_task("auth", &task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.current_step, 2);
        assert_eq!(
            task.metadata.get("resume_from_step"),
            Some(&json!(2))
        );
        assert_eq!(
            task.metadata.get("rejection_feedback"),
            Some(&json!("Fix auth flow"))
        );
        // Steps from the resume point will run again.
        assert!(task.steps[1].is_completed());
        assert!(!task.steps[2].is_completed());
        assert!(!task.steps[4].is_completed());

        let artifact = harness
            .store
            .get_artifact("auth", &task.id, "rejection-feedback.md")
            .unwrap();
        let body = String::from_utf8(artifact).unwrap();
        assert!(body.starts_with("# Rejection Feedback"));
        assert!(body.contains("Resume From: Step 3"));
        assert!(body.contains("Fix auth flow"));

        let hook = harness.hooks.get("auth", &task.id).unwrap();
        assert_eq!(hook.state, HookState::StepRunning);
    }

    #[test]
    fn test_reject_retry_requires_feedback() {
        let harness = Harness::new();
        let (ws, task) = harness.seed_parked("auth");
        let err = harness
            .flow
            .reject_retry(&ws, &task, "   ", None)
            .unwrap_err();
        assert_eq!(err.kind(), "empty_value");
    }

    #[test]
    fn test_reject_retry_default_step_targets_implementation() {
        let harness = Harness::new();
        let (ws, task) = harness.seed_parked("auth");
        harness
            .flow
            .reject_retry(&ws, &task, "rework it", None)
            .unwrap();
        let task = harness.store.get_task("auth", &task.id).unwrap();
        // "implement" is step 0 in the feature template.
        assert_eq!(task.current_step, 0);
        assert_eq!(task.metadata.get("resume_from_step"), Some(&json!(0)));
    }

    #[test]
    fn test_reject_retry_step_out_of_range() {
        let harness = Harness::new();
        let (ws, task) = harness.seed_parked("auth");
        let err = harness
            .flow
            .reject_retry(&ws, &task, "feedback", Some(99))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        let err = harness
            .flow
            .reject_retry(&ws, &task, "feedback", Some(0))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn test_reject_done_preserves_workspace() {
        let harness = Harness::new();
        let (ws, task) = harness.seed_parked("auth");
        let report = harness.flow.reject_done(&ws, &task).unwrap();
        assert_eq!(report.status, TaskStatus::Rejected);

        let task = harness.store.get_task("auth", &task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Rejected);
        // Workspace status unchanged: branch and worktree stay for manual work.
        let ws = harness.store.get_workspace("auth").unwrap();
        assert_eq!(ws.status, WorkspaceStatus::Active);

        let hook = harness.hooks.get("auth", &task.id).unwrap();
        assert_eq!(hook.state, HookState::Abandoned);
    }

    #[test]
    fn test_abandon_task() {
        let harness = Harness::new();
        let (_, task) = harness.seed_parked("auth");
        let report = harness.flow.abandon("auth").unwrap();
        assert_eq!(report.status, TaskStatus::Abandoned);
        assert_eq!(report.task_id, task.id);

        let task = harness.store.get_task("auth", &task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Abandoned);
        assert_eq!(task.current_step, task.steps.len());
    }

    #[test]
    fn test_abandon_without_tasks() {
        let harness = Harness::new();
        let ws = Workspace::new("empty", "b", PathBuf::from("/wt"), PathBuf::from("/repo"));
        harness.store.create_workspace(&ws).unwrap();
        let err = harness.flow.abandon("empty").unwrap_err();
        assert_eq!(err.kind(), "no_tasks_found");
    }

    #[test]
    fn test_default_resume_index_markers() {
        let template = TaskTemplate {
            name: "t".into(),
            steps: vec![
                ("setup".into(), crate::model::StepKind::Validate),
                ("write-code".into(), crate::model::StepKind::AiStep),
                ("commit".into(), crate::model::StepKind::Commit),
            ],
        };
        let task = Task::new("ws", "d", &template);
        assert_eq!(default_resume_index(&task), 1);

        let template = TaskTemplate {
            name: "t".into(),
            steps: vec![("validate".into(), crate::model::StepKind::Validate)],
        };
        let task = Task::new("ws", "d", &template);
        assert_eq!(default_resume_index(&task), 0);
    }
}
