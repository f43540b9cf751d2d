//! The task execution engine: a step-by-step state machine that persists
//! progress atomically and resumes cleanly after interruption.
//!
//! Persistence order within a step is fixed: hook first (checkpoint), then
//! the task record. Resume exploits this: a checkpoint newer than the task's
//! `updated_at` marks the one step that finished but was never journaled.

mod context;
mod executors;

pub use context::{BellNotifier, Capabilities, Notifier, StepOutcome, TaskContext};
pub use executors::{ExecutorRegistry, StepExecutor};

use std::time::Instant;

use chrono::Utc;

use crate::config::AtlasConfig;
use crate::error::AtlasError;
use crate::hook::HookStore;
use crate::logging::TaskLogger;
use crate::model::{
    CheckpointTrigger, CurrentStep, Hook, HookState, StepKind, Task, TaskStatus, Workspace,
};
use crate::store::Store;
use crate::validate::CancelToken;

/// Attempt ceiling surfaced in the hook's step context.
pub const MAX_STEP_ATTEMPTS: u32 = 3;

/// How a drive of the engine ended.
#[derive(Debug)]
pub enum EngineOutcome {
    Completed,
    AwaitingApproval,
    Recoverable { status: TaskStatus, reason: String },
    Cancelled,
}

pub struct TaskEngine {
    store: Store,
    hooks: HookStore,
    config: AtlasConfig,
    caps: Capabilities,
    registry: ExecutorRegistry,
    cancel: CancelToken,
}

impl TaskEngine {
    pub fn new(store: Store, hooks: HookStore, config: AtlasConfig, caps: Capabilities) -> Self {
        Self {
            store,
            hooks,
            config,
            caps,
            registry: ExecutorRegistry::builtin(),
            cancel: CancelToken::new(),
        }
    }

    /// Substitute executors (tests).
    pub fn with_registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Clone of the cancel token, for wiring into a Ctrl-C handler.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run a task from its persisted position.
    pub fn run(&self, workspace: &str, task_id: &str) -> Result<EngineOutcome, AtlasError> {
        let mut task = self.store.get_task(workspace, task_id)?;
        let workspace = self.store.get_workspace(workspace)?;
        let mut hook = match self.hooks.get(&workspace.name, task_id) {
            Ok(hook) => hook,
            Err(AtlasError::HookNotFound { .. }) => self.hooks.create(task_id, &workspace.name)?,
            Err(e) => return Err(e),
        };

        if task.status == TaskStatus::Pending {
            task.transition(TaskStatus::Running, "Task started")?;
            self.store.update_task(&task)?;
            self.sync_workspace_ref(&task)?;
        }

        self.drive(&mut task, &workspace, &mut hook)
    }

    /// Re-enter a parked or failed task.
    ///
    /// Refuses unless the status is resumable. A `running` task is accepted
    /// only as crash recovery: its hook must still be mid-step.
    pub fn resume(&self, workspace: &str, task_id: &str) -> Result<EngineOutcome, AtlasError> {
        let mut task = self.store.get_task(workspace, task_id)?;
        let workspace = self.store.get_workspace(workspace)?;
        let mut hook = self.hooks.get(&workspace.name, task_id)?;

        if !task.status.is_resumable() {
            return Err(AtlasError::InvalidTransition {
                from: task.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }
        if task.status == TaskStatus::Running
            && !matches!(hook.state, HookState::StepRunning | HookState::StepWaiting)
        {
            return Err(AtlasError::InvalidTransition {
                from: task.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }

        self.skip_completed_steps(&mut task, &hook);

        if task.status != TaskStatus::Running {
            task.transition(TaskStatus::Running, "Resumed")?;
        }
        self.store.update_task(&task)?;
        self.sync_workspace_ref(&task)?;

        let logger = TaskLogger::new(self.store.clone(), &workspace.name, &task.id);
        logger.info("task_resumed", None);

        self.drive(&mut task, &workspace, &mut hook)
    }

    /// Advance past steps that already ran.
    ///
    /// The task record is authoritative (`completed_at`). On top of that,
    /// checkpoints newer than the task's `updated_at` identify the crash
    /// window: a step whose checkpoint was journaled but whose task update
    /// never landed. Approval gates are never skipped.
    fn skip_completed_steps(&self, task: &mut Task, hook: &Hook) {
        let crash_window: Vec<usize> = hook
            .checkpoints
            .iter()
            .filter(|cp| {
                !matches!(
                    cp.trigger,
                    CheckpointTrigger::Manual | CheckpointTrigger::Interval
                )
            })
            .filter(|cp| cp.created_at > task.updated_at)
            .filter_map(|cp| cp.step_index)
            .collect();

        let mut current = task.current_step;
        while current < task.steps.len() {
            let step = &mut task.steps[current];
            if step.is_completed() {
                current += 1;
                continue;
            }
            if step.kind != StepKind::AwaitApproval && crash_window.contains(&current) {
                step.completed_at = Some(Utc::now());
                current += 1;
                continue;
            }
            break;
        }

        task.current_step = current;
    }

    fn drive(
        &self,
        task: &mut Task,
        workspace: &Workspace,
        hook: &mut Hook,
    ) -> Result<EngineOutcome, AtlasError> {
        let logger = TaskLogger::new(self.store.clone(), &workspace.name, &task.id);

        loop {
            if self.cancel.is_cancelled() {
                return self.interrupt(task, &logger);
            }

            if task.steps_exhausted() {
                return self.finish(task, hook, &logger);
            }

            let step_index = task.current_step;
            let (step_name, step_kind) = {
                let step = &mut task.steps[step_index];
                step.attempts += 1;
                (step.name.clone(), step.kind)
            };

            // Hook first: the recovery record must know about the step
            // before it runs.
            hook.current_step = Some(CurrentStep {
                name: step_name.clone(),
                index: step_index,
                attempt: task.steps[step_index].attempts,
                max_attempts: MAX_STEP_ATTEMPTS,
            });
            if hook.state != HookState::StepRunning {
                hook.transition(
                    HookState::StepRunning,
                    "engine begins a step",
                    Some(step_name.clone()),
                )?;
            }
            self.hooks.save(hook)?;

            let is_validation = matches!(
                step_kind,
                StepKind::Format
                    | StepKind::Lint
                    | StepKind::Test
                    | StepKind::PreCommit
                    | StepKind::Validate
            );
            if is_validation && task.status == TaskStatus::Running {
                task.transition(TaskStatus::Validating, "Validation started")?;
            }
            self.store.update_task(task)?;

            logger.info("step_started", Some(&step_name));
            let started = Instant::now();

            let executor =
                self.registry
                    .get(step_kind)
                    .ok_or_else(|| AtlasError::InvalidArgument {
                        message: format!("no executor registered for '{step_kind}'"),
                    })?;

            let outcome = {
                let mut ctx = TaskContext {
                    task: &mut *task,
                    workspace,
                    work_dir: &workspace.worktree_path,
                    store: &self.store,
                    logger: &logger,
                    config: &self.config,
                    caps: &self.caps,
                    cancel: &self.cancel,
                };
                executor.execute(&mut ctx, hook, &self.hooks)
            };

            match outcome {
                Err(e) => {
                    let message = e.plain_message();
                    logger.error("step_failed", Some(&step_name), &message);
                    hook.transition(HookState::Failed, "non-retryable error", Some(message))?;
                    hook.current_step = None;
                    self.hooks.save(hook)?;
                    self.store.update_task(task)?;
                    self.sync_workspace_ref(task)?;
                    return Err(e);
                }
                Ok(StepOutcome::Success(metadata)) => {
                    if task.status == TaskStatus::Validating {
                        task.transition(TaskStatus::Running, "Validation passed")?;
                    }
                    for (key, value) in metadata {
                        task.metadata.insert(key, value);
                    }
                    task.steps[step_index].completed_at = Some(Utc::now());
                    task.current_step = step_index + 1;
                    hook.add_checkpoint(
                        checkpoint_trigger(step_kind),
                        None,
                        Some((step_name.as_str(), step_index)),
                    );
                    hook.current_step = None;
                    self.hooks.save(hook)?;
                    self.store.update_task(task)?;
                    logger.step_finished("step_completed", &step_name, started.elapsed());
                }
                Ok(StepOutcome::Paused) => {
                    task.transition(TaskStatus::AwaitingApproval, "Awaiting user approval")?;
                    hook.add_checkpoint(
                        CheckpointTrigger::StepComplete,
                        Some("awaiting approval"),
                        Some((step_name.as_str(), step_index)),
                    );
                    hook.transition(HookState::StepWaiting, "step requests approval", None)?;
                    self.hooks.save(hook)?;
                    self.store.update_task(task)?;
                    self.sync_workspace_ref(task)?;
                    self.caps.notifier.notify(task, task.status);
                    logger.info("awaiting_approval", Some(&step_name));
                    return Ok(EngineOutcome::AwaitingApproval);
                }
                Ok(StepOutcome::Recoverable { status, reason }) => {
                    task.transition(status, &reason)?;
                    hook.transition(
                        HookState::StepWaiting,
                        "recoverable failure",
                        Some(reason.clone()),
                    )?;
                    self.hooks.save(hook)?;
                    self.store.update_task(task)?;
                    self.sync_workspace_ref(task)?;
                    self.caps.notifier.notify(task, status);
                    logger.error("step_recoverable_failure", Some(&step_name), &reason);
                    return Ok(EngineOutcome::Recoverable { status, reason });
                }
                Ok(StepOutcome::Cancelled) => {
                    return self.interrupt(task, &logger);
                }
            }
        }
    }

    /// All steps ran: complete the task and the hook.
    fn finish(
        &self,
        task: &mut Task,
        hook: &mut Hook,
        logger: &TaskLogger,
    ) -> Result<EngineOutcome, AtlasError> {
        if task.status != TaskStatus::Completed {
            task.transition(TaskStatus::Completed, "All steps completed")?;
        }
        hook.current_step = None;
        if hook.state == HookState::StepWaiting {
            hook.transition(HookState::StepRunning, "input supplied", None)?;
        }
        if hook.state != HookState::Completed {
            hook.transition(HookState::Completed, "last step succeeded", None)?;
        }
        self.hooks.save(hook)?;
        self.store.update_task(task)?;
        self.sync_workspace_ref(task)?;
        logger.info("task_completed", None);
        Ok(EngineOutcome::Completed)
    }

    /// A cancel was observed: journal the interruption without changing
    /// status, finish pending writes, and stop.
    fn interrupt(&self, task: &mut Task, logger: &TaskLogger) -> Result<EngineOutcome, AtlasError> {
        task.transition(task.status, "Interrupted by cancellation")?;
        self.store.update_task(task)?;
        logger.info("task_interrupted", None);
        Ok(EngineOutcome::Cancelled)
    }

    /// Keep the workspace record's lightweight task reference current.
    fn sync_workspace_ref(&self, task: &Task) -> Result<(), AtlasError> {
        let mut workspace = self.store.get_workspace(&task.workspace)?;
        workspace.upsert_task_ref(&task.id, task.status);
        self.store.update_workspace(&workspace)
    }
}

fn checkpoint_trigger(kind: StepKind) -> CheckpointTrigger {
    match kind {
        StepKind::Commit => CheckpointTrigger::GitCommit,
        StepKind::Push => CheckpointTrigger::GitPush,
        StepKind::Pr => CheckpointTrigger::PrCreated,
        StepKind::Format
        | StepKind::Lint
        | StepKind::Test
        | StepKind::PreCommit
        | StepKind::Validate => CheckpointTrigger::Validation,
        StepKind::AiStep | StepKind::AwaitApproval | StepKind::CiWatch => {
            CheckpointTrigger::StepComplete
        }
    }
}
