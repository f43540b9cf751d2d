//! Built-in step executors, registered by step type tag.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde_json::json;

use crate::agent::{StepPromptContext, build_commit_prompt, build_step_prompt};
use crate::error::AtlasError;
use crate::forge::CiOutcome;
use crate::hook::HookStore;
use crate::model::{CheckpointTrigger, Hook, StepKind, TaskStatus, ValidationReceipt};
use crate::styling::progress_message;
use crate::validate::{
    ProgressInfo, ProgressStatus, Stage, ValidationOptions, ValidationPipeline,
};

use super::context::{StepOutcome, TaskContext};

/// One step executor. Implementations receive the task context plus the
/// active hook (for checkpoints and receipts) and report an outcome; a hard
/// `Err` is a non-retryable failure.
pub trait StepExecutor: Send + Sync {
    fn execute(
        &self,
        ctx: &mut TaskContext<'_>,
        hook: &mut Hook,
        hooks: &HookStore,
    ) -> Result<StepOutcome, AtlasError>;
}

/// Maps step kinds to executors. The set is closed; registration exists for
/// tests to substitute stubs.
pub struct ExecutorRegistry {
    executors: HashMap<StepKind, Box<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    /// The built-in registry covering every [`StepKind`].
    pub fn builtin() -> Self {
        let mut registry = Self {
            executors: HashMap::new(),
        };
        registry.register(StepKind::AiStep, Box::new(AiStepExecutor));
        registry.register(StepKind::Format, Box::new(ValidateExecutor::stage(Stage::Format)));
        registry.register(StepKind::Lint, Box::new(ValidateExecutor::stage(Stage::Lint)));
        registry.register(StepKind::Test, Box::new(ValidateExecutor::stage(Stage::Test)));
        registry.register(
            StepKind::PreCommit,
            Box::new(ValidateExecutor::stage(Stage::PreCommit)),
        );
        registry.register(StepKind::Validate, Box::new(ValidateExecutor::all()));
        registry.register(StepKind::Commit, Box::new(CommitExecutor));
        registry.register(StepKind::Push, Box::new(PushExecutor));
        registry.register(StepKind::Pr, Box::new(PrExecutor));
        registry.register(StepKind::AwaitApproval, Box::new(AwaitApprovalExecutor));
        registry.register(StepKind::CiWatch, Box::new(CiWatchExecutor));
        registry
    }

    pub fn register(&mut self, kind: StepKind, executor: Box<dyn StepExecutor>) {
        self.executors.insert(kind, executor);
    }

    pub fn get(&self, kind: StepKind) -> Option<&dyn StepExecutor> {
        self.executors.get(&kind).map(|e| e.as_ref())
    }
}

// ---------------------------------------------------------------------------
// ai_step
// ---------------------------------------------------------------------------

/// Runs the external AI agent with a templated prompt and saves its output
/// as a step artifact.
struct AiStepExecutor;

impl StepExecutor for AiStepExecutor {
    fn execute(
        &self,
        ctx: &mut TaskContext<'_>,
        _hook: &mut Hook,
        _hooks: &HookStore,
    ) -> Result<StepOutcome, AtlasError> {
        let Some(agent) = ctx.caps.agent.clone() else {
            return Err(AtlasError::InvalidArgument {
                message: "no agent command configured (set agent.command)".into(),
            });
        };

        let step_name = ctx
            .task
            .current_step_ref()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "ai_step".into());
        let artifacts = ctx.list_artifacts()?;
        let rejection_feedback = ctx
            .task
            .metadata
            .get("rejection_feedback")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let prompt = build_step_prompt(
            ctx.config.agent.step_template.as_deref(),
            &StepPromptContext {
                description: &ctx.task.description,
                workspace: &ctx.workspace.name,
                branch: &ctx.workspace.branch,
                rejection_feedback: rejection_feedback.as_deref(),
                artifacts: &artifacts,
            },
        )?;

        ctx.logger.info("agent_started", Some(&step_name));
        let output = agent.run(&prompt, ctx.work_dir, None)?;
        if ctx.cancel.is_cancelled() {
            return Ok(StepOutcome::Cancelled);
        }

        let artifact = ctx.save_artifact(&format!("{step_name}-output.md"), output.as_bytes())?;
        ctx.logger.log(
            crate::logging::LogLevel::Info,
            "agent_finished",
            Some(&step_name),
            json!({ "artifact": artifact }),
        );
        Ok(StepOutcome::success())
    }
}

// ---------------------------------------------------------------------------
// format / lint / test / pre_commit / validate
// ---------------------------------------------------------------------------

/// Invokes the validation pipeline for one stage or for the full sequence.
struct ValidateExecutor {
    stage: Option<Stage>,
}

impl ValidateExecutor {
    fn all() -> Self {
        Self { stage: None }
    }

    fn stage(stage: Stage) -> Self {
        Self { stage: Some(stage) }
    }

    fn options(&self, ctx: &TaskContext<'_>) -> ValidationOptions {
        let options = ctx.config.validation_options();
        match self.stage {
            Some(stage) => options.only_stage(stage),
            None => options,
        }
    }
}

impl StepExecutor for ValidateExecutor {
    fn execute(
        &self,
        ctx: &mut TaskContext<'_>,
        hook: &mut Hook,
        hooks: &HookStore,
    ) -> Result<StepOutcome, AtlasError> {
        let step_name = ctx
            .task
            .current_step_ref()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "validate".into());

        let progress = |step: &str, status: ProgressStatus, info: &ProgressInfo| {
            let line = match status {
                ProgressStatus::Starting => {
                    format!("{step} ({}/{})", info.current_step, info.total_steps)
                }
                _ => format!("{step}: {status}"),
            };
            let _ = crate::output::print_text(&progress_message(line));
        };

        let pipeline = ValidationPipeline::new(self.options(ctx), ctx.work_dir);
        let result = pipeline.run(Some(&progress), ctx.cancel);

        // One signed receipt per executed command.
        for command_result in result.results.iter().filter(|r| r.executed()) {
            hooks.append_signed_receipt(
                hook,
                ValidationReceipt {
                    id: String::new(),
                    step_name: step_name.clone(),
                    command: command_result.command.clone(),
                    exit_code: command_result.exit_code.unwrap_or(-1),
                    duration_ms: command_result.duration_ms,
                    key_fingerprint: String::new(),
                    signature: None,
                },
            );
        }
        hooks.save(hook)?;

        if ctx.cancel.is_cancelled() {
            return Ok(StepOutcome::Cancelled);
        }

        for skipped in &result.skipped {
            ctx.logger.log(
                crate::logging::LogLevel::Info,
                "validation_step_skipped",
                Some(&step_name),
                json!({ "skipped_step": skipped.step, "reason": skipped.reason }),
            );
        }

        if result.success {
            Ok(StepOutcome::success())
        } else {
            let failed: Vec<String> = result
                .results
                .iter()
                .filter(|r| !r.success && r.executed())
                .map(|r| format!("{} ({})", r.command, r.stage))
                .collect();
            Ok(StepOutcome::Recoverable {
                status: TaskStatus::ValidationFailed,
                reason: format!("validation failed: {}", failed.join(", ")),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// commit
// ---------------------------------------------------------------------------

/// Stages everything and commits with a generated message.
struct CommitExecutor;

impl StepExecutor for CommitExecutor {
    fn execute(
        &self,
        ctx: &mut TaskContext<'_>,
        _hook: &mut Hook,
        _hooks: &HookStore,
    ) -> Result<StepOutcome, AtlasError> {
        let vcs = ctx.caps.vcs.clone();
        vcs.stage_all(ctx.work_dir)?;
        if !vcs.has_staged_changes(ctx.work_dir)? {
            let mut metadata = IndexMap::new();
            metadata.insert("commit".into(), json!("skipped (no changes)"));
            ctx.logger.info("commit_skipped_no_changes", None);
            return Ok(StepOutcome::Success(metadata));
        }

        let message = self.generate_message(ctx)?;
        vcs.commit(ctx.work_dir, &message)?;
        let mut metadata = IndexMap::new();
        metadata.insert(
            "commit_subject".into(),
            json!(message.lines().next().unwrap_or_default()),
        );
        Ok(StepOutcome::Success(metadata))
    }
}

impl CommitExecutor {
    /// Ask the agent for a message; without an agent fall back to a
    /// deterministic one derived from the task description.
    fn generate_message(&self, ctx: &TaskContext<'_>) -> Result<String, AtlasError> {
        let Some(agent) = ctx.caps.agent.clone() else {
            return Ok(format!("atlas: {}", ctx.task.description));
        };
        let diff = ctx.caps.vcs.staged_diff(ctx.work_dir)?;
        let recent = ctx.caps.vcs.recent_commits(ctx.work_dir, 10)?;
        let prompt = build_commit_prompt(
            ctx.config.agent.commit_template.as_deref(),
            &diff,
            &ctx.workspace.branch,
            &recent,
        )?;
        agent.run(&prompt, ctx.work_dir, None)
    }
}

// ---------------------------------------------------------------------------
// push
// ---------------------------------------------------------------------------

struct PushExecutor;

impl StepExecutor for PushExecutor {
    fn execute(
        &self,
        ctx: &mut TaskContext<'_>,
        _hook: &mut Hook,
        _hooks: &HookStore,
    ) -> Result<StepOutcome, AtlasError> {
        match ctx.caps.vcs.push(ctx.work_dir, &ctx.workspace.branch) {
            Ok(()) => Ok(StepOutcome::success()),
            // Push and forge failures share the recoverable gh_failed exit
            // so `resume` can retry after the remote recovers.
            Err(e) => Ok(StepOutcome::Recoverable {
                status: TaskStatus::GhFailed,
                reason: e.plain_message(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// pr
// ---------------------------------------------------------------------------

struct PrExecutor;

impl StepExecutor for PrExecutor {
    fn execute(
        &self,
        ctx: &mut TaskContext<'_>,
        _hook: &mut Hook,
        _hooks: &HookStore,
    ) -> Result<StepOutcome, AtlasError> {
        let title = ctx
            .task
            .description
            .lines()
            .next()
            .unwrap_or("atlas task")
            .to_string();
        let body = format!(
            "{}\n\n---\nWorkspace: {}\nTask: {}\n",
            ctx.task.description, ctx.workspace.name, ctx.task.id
        );
        match ctx.caps.forge.create_pr(
            ctx.work_dir,
            &title,
            &body,
            &ctx.config.forge.base_branch,
        ) {
            Ok(url) => {
                let mut metadata = IndexMap::new();
                metadata.insert("pr_url".into(), json!(url));
                Ok(StepOutcome::Success(metadata))
            }
            Err(e) => Ok(StepOutcome::Recoverable {
                status: TaskStatus::GhFailed,
                reason: e.plain_message(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// await_approval
// ---------------------------------------------------------------------------

struct AwaitApprovalExecutor;

impl StepExecutor for AwaitApprovalExecutor {
    fn execute(
        &self,
        _ctx: &mut TaskContext<'_>,
        _hook: &mut Hook,
        _hooks: &HookStore,
    ) -> Result<StepOutcome, AtlasError> {
        Ok(StepOutcome::Paused)
    }
}

// ---------------------------------------------------------------------------
// ci_watch
// ---------------------------------------------------------------------------

/// Polls CI until it settles, times out, or is cancelled. Long polls emit
/// interval checkpoints so a crash mid-watch resumes with recent context.
struct CiWatchExecutor;

impl StepExecutor for CiWatchExecutor {
    fn execute(
        &self,
        ctx: &mut TaskContext<'_>,
        hook: &mut Hook,
        hooks: &HookStore,
    ) -> Result<StepOutcome, AtlasError> {
        let poll_interval = Duration::from_secs(ctx.config.ci.poll_interval_secs.max(1));
        let deadline = Instant::now() + Duration::from_secs(ctx.config.ci.timeout_secs);
        let checkpoint_interval = ctx.config.checkpoint_interval();
        let mut last_checkpoint = Instant::now();

        loop {
            if ctx.cancel.is_cancelled() {
                return Ok(StepOutcome::Cancelled);
            }
            match ctx.caps.forge.ci_status(ctx.work_dir, &ctx.workspace.branch) {
                Ok(CiOutcome::Passing) => return Ok(StepOutcome::success()),
                Ok(CiOutcome::Failing) => {
                    return Ok(StepOutcome::Recoverable {
                        status: TaskStatus::CiFailed,
                        reason: "CI reported a failing check".into(),
                    });
                }
                Ok(CiOutcome::Pending) => {}
                // Forge client errors are transient from the engine's view;
                // resume retries the watch.
                Err(e) => {
                    return Ok(StepOutcome::Recoverable {
                        status: TaskStatus::GhFailed,
                        reason: e.plain_message(),
                    });
                }
            }

            if Instant::now() >= deadline {
                return Ok(StepOutcome::Recoverable {
                    status: TaskStatus::CiTimeout,
                    reason: format!("CI did not settle within {}s", ctx.config.ci.timeout_secs),
                });
            }

            if last_checkpoint.elapsed() >= checkpoint_interval {
                let step = ctx
                    .task
                    .current_step_ref()
                    .map(|s| (s.name.as_str(), ctx.task.current_step));
                hook.add_checkpoint(CheckpointTrigger::Interval, Some("waiting on CI"), step);
                hooks.save(hook)?;
                last_checkpoint = Instant::now();
            }

            std::thread::sleep(poll_interval.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}
