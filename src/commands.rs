//! Command handlers: wire the CLI surface to the core subsystems.

use std::io::{BufRead, IsTerminal, Write};
use std::sync::{Arc, Mutex};

use color_print::cformat;
use serde_json::json;

use atlas::agent::CommandAgent;
use atlas::approval::{ApprovalAction, ApprovalFlow, ApprovalReport};
use atlas::cleanup::cleanup_hooks;
use atlas::config::AtlasConfig;
use atlas::engine::{BellNotifier, Capabilities, EngineOutcome, TaskEngine};
use atlas::error::AtlasError;
use atlas::forge::GhClient;
use atlas::home::AtlasHome;
use atlas::hook::HookStore;
use atlas::keys::KeyManager;
use atlas::model::{CheckpointTrigger, Task, TaskStatus, Workspace};
use atlas::output::{OutputFormat, fail, print_json, print_text};
use atlas::store::Store;
use atlas::styling::{
    PROMPT_EMOJI, format_with_gutter, hint_message, info_message, progress_message,
    success_message, warning_message,
};
use atlas::validate::{
    CancelToken, PipelineResult, ProgressInfo, ProgressStatus, SharedWriter, Stage,
    ValidationPipeline,
};
use atlas::vcs::{GitRunner, VcsRunner};
use atlas::workspace::WorkspaceManager;

use crate::cli::{HookCommand, StageArgs, WorkspaceCommand};

/// Shared handles every handler needs.
pub struct App {
    pub store: Store,
    pub hooks: HookStore,
    pub config: AtlasConfig,
}

impl App {
    pub fn new() -> Result<Self, AtlasError> {
        let home = AtlasHome::from_env()?;
        let store = Store::new(home.clone());
        let keys = Arc::new(KeyManager::load_or_create(&home.signing_key_path())?);
        let hooks = HookStore::new(store.clone(), keys);
        let config = AtlasConfig::load()?;
        Ok(Self {
            store,
            hooks,
            config,
        })
    }

    fn capabilities(&self) -> Capabilities {
        let agent = self
            .config
            .agent
            .command
            .as_deref()
            .map(|command| -> Arc<dyn atlas::agent::AgentRunner> {
                Arc::new(CommandAgent::new(command, &self.config.agent.args))
            });
        Capabilities {
            vcs: Arc::new(GitRunner),
            forge: Arc::new(GhClient::new(&self.config.forge.command)),
            agent,
            notifier: Arc::new(BellNotifier),
        }
    }

    /// Engine with Ctrl-C wired to its cancel token.
    fn engine(&self) -> TaskEngine {
        let engine = TaskEngine::new(
            self.store.clone(),
            self.hooks.clone(),
            self.config.clone(),
            self.capabilities(),
        );
        register_interrupt(&engine.cancel_token());
        engine
    }

    fn manager(&self) -> WorkspaceManager {
        WorkspaceManager::new(self.store.clone(), Arc::new(GitRunner))
    }

    fn flow(&self) -> ApprovalFlow {
        ApprovalFlow::new(self.store.clone(), self.hooks.clone())
    }
}

fn register_interrupt(cancel: &CancelToken) {
    #[cfg(unix)]
    {
        let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.flag());
    }
    #[cfg(not(unix))]
    let _ = cancel;
}

/// Run a handler body, converting errors to the JSON document form when the
/// command is in JSON mode.
fn with_format<T>(
    format: OutputFormat,
    body: impl FnOnce() -> Result<T, AtlasError>,
) -> Result<T, AtlasError> {
    body().map_err(|e| fail(format, e))
}

// ---------------------------------------------------------------------------
// start / resume
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub fn handle_start(
    app: &App,
    workspace: &str,
    description: &str,
    template: &str,
    branch: Option<String>,
    base: Option<String>,
    format: OutputFormat,
) -> Result<(), AtlasError> {
    with_format(format, || {
        if description.trim().is_empty() {
            return Err(AtlasError::EmptyValue {
                field: "description".into(),
            });
        }
        let template = app.config.template(template)?;
        let branch = branch.unwrap_or_else(|| format!("atlas/{workspace}"));
        let base = base.unwrap_or_else(|| app.config.forge.base_branch.clone());
        let repo_root = std::env::current_dir().map_err(|source| AtlasError::Io {
            context: "resolving current directory".into(),
            source,
        })?;

        let workspace_record = app.manager().create(workspace, &branch, &base, &repo_root)?;
        if !format.is_json() {
            print_text(&progress_message(cformat!(
                "Created workspace <bold>{workspace}</> on branch <bold>{branch}</>"
            )))?;
        }

        let task = Task::new(workspace, description, &template);
        app.store.create_task(&task)?;
        let mut ws = app.store.get_workspace(&workspace_record.name)?;
        ws.upsert_task_ref(&task.id, task.status);
        app.store.update_workspace(&ws)?;

        let outcome = app.engine().run(workspace, &task.id)?;
        render_outcome(app, workspace, &task.id, &outcome, format)
    })
}

pub fn handle_resume(
    app: &App,
    workspace: &str,
    ai_fix: bool,
    format: OutputFormat,
) -> Result<(), AtlasError> {
    with_format(format, || {
        let task = app
            .store
            .list_tasks(workspace)?
            .into_iter()
            .filter(|t| t.status.is_resumable())
            .max_by_key(|t| t.updated_at)
            .ok_or(AtlasError::NoTasksFound {
                workspace: Some(workspace.to_string()),
            })?;

        if ai_fix {
            let mut task = app.store.get_task(workspace, &task.id)?;
            task.metadata.insert("resume_mode".into(), json!("ai_fix"));
            app.store.update_task(&task)?;
        }

        let outcome = app.engine().resume(workspace, &task.id)?;
        render_outcome(app, workspace, &task.id, &outcome, format)
    })
}

fn render_outcome(
    app: &App,
    workspace: &str,
    task_id: &str,
    outcome: &EngineOutcome,
    format: OutputFormat,
) -> Result<(), AtlasError> {
    let task = app.store.get_task(workspace, task_id)?;
    if format.is_json() {
        return print_json(&json!({ "task": task }));
    }
    match outcome {
        EngineOutcome::Completed => print_text(&success_message(cformat!(
            "Task <bold>{task_id}</> completed"
        ))),
        EngineOutcome::AwaitingApproval => {
            if let Some(url) = task.metadata.get("pr_url").and_then(|v| v.as_str()) {
                print_text(&info_message(cformat!("PR: <bold>{url}</>")))?;
            }
            print_text(&info_message(cformat!(
                "Task <bold>{task_id}</> is awaiting approval"
            )))?;
            print_text(&hint_message(format!("Run 'atlas approve {workspace}'")))
        }
        EngineOutcome::Recoverable { status, reason } => {
            print_text(&warning_message(cformat!(
                "Task <bold>{task_id}</> stopped: {status} ({reason})"
            )))?;
            print_text(&hint_message(format!(
                "Fix the problem and run 'atlas resume {workspace}'"
            )))
        }
        EngineOutcome::Cancelled => print_text(&warning_message(cformat!(
            "Task <bold>{task_id}</> interrupted; run 'atlas resume {workspace}' to continue"
        ))),
    }
}

// ---------------------------------------------------------------------------
// approve / reject / abandon
// ---------------------------------------------------------------------------

pub fn handle_approve(
    app: &App,
    workspace: Option<String>,
    auto_approve: bool,
    close: bool,
    format: OutputFormat,
) -> Result<(), AtlasError> {
    with_format(format, || {
        let non_interactive = auto_approve || format.is_json();
        if non_interactive && workspace.is_none() {
            return Err(AtlasError::InteractiveRequired {
                message: "non-interactive approval requires a workspace argument".into(),
            });
        }

        let (ws, task) = app.flow().find_awaiting(workspace.as_deref())?;
        if non_interactive {
            let report = app.flow().approve(&ws, &task, close)?;
            return render_report(&report, format);
        }

        approval_menu(app, &ws, &task, close)
    })
}

#[allow(clippy::too_many_arguments)]
pub fn handle_reject(
    app: &App,
    workspace: Option<String>,
    retry: bool,
    done: bool,
    feedback: Option<String>,
    step: Option<usize>,
    format: OutputFormat,
) -> Result<(), AtlasError> {
    with_format(format, || {
        if format.is_json() {
            if workspace.is_none() {
                return Err(AtlasError::InteractiveRequired {
                    message: "non-interactive rejection requires a workspace argument".into(),
                });
            }
            if !retry && !done {
                return Err(AtlasError::InvalidArgument {
                    message: "pass --retry --feedback <text> [--step N] or --done".into(),
                });
            }
        }

        let (ws, task) = app.flow().find_awaiting(workspace.as_deref())?;
        let report = if retry {
            let feedback = feedback.ok_or(AtlasError::EmptyValue {
                field: "feedback".into(),
            })?;
            app.flow().reject_retry(&ws, &task, &feedback, step)?
        } else if done {
            app.flow().reject_done(&ws, &task)?
        } else {
            // Interactive: ask which rejection mode.
            let answer = prompt("Retry with feedback? [y/N] ")?;
            if answer.eq_ignore_ascii_case("y") {
                let feedback = prompt("Feedback: ")?;
                let step = prompt("Resume from step (empty for default): ")?;
                let step = if step.is_empty() {
                    None
                } else {
                    Some(step.parse::<usize>().map_err(|_| {
                        AtlasError::InvalidArgument {
                            message: format!("'{step}' is not a step number"),
                        }
                    })?)
                };
                app.flow().reject_retry(&ws, &task, &feedback, step)?
            } else {
                app.flow().reject_done(&ws, &task)?
            }
        };

        render_report(&report, format)?;
        if report.status == TaskStatus::Running && !format.is_json() {
            print_text(&hint_message(format!(
                "Run 'atlas resume {}' to retry with the feedback applied",
                report.workspace
            )))?;
        }
        Ok(())
    })
}

pub fn handle_abandon(
    app: &App,
    workspace: &str,
    format: OutputFormat,
) -> Result<(), AtlasError> {
    with_format(format, || {
        let report = app.flow().abandon(workspace)?;
        render_report(&report, format)
    })
}

fn render_report(report: &ApprovalReport, format: OutputFormat) -> Result<(), AtlasError> {
    if format.is_json() {
        return print_json(&json!({
            "workspace": report.workspace,
            "task_id": report.task_id,
            "status": report.status,
            "already_done": report.already_done,
        }));
    }
    let task_id = &report.task_id;
    let line = match report.status {
        TaskStatus::Completed if report.already_done => {
            info_message(cformat!("Task <bold>{task_id}</> was already completed"))
        }
        TaskStatus::Completed => success_message(cformat!("Task <bold>{task_id}</> approved")),
        TaskStatus::Running => info_message(cformat!(
            "Task <bold>{task_id}</> rewound and ready to retry"
        )),
        TaskStatus::Rejected => info_message(cformat!(
            "Task <bold>{task_id}</> rejected; branch preserved for manual work"
        )),
        TaskStatus::Abandoned => info_message(cformat!("Task <bold>{task_id}</> abandoned")),
        status => info_message(cformat!("Task <bold>{task_id}</> is now {status}")),
    };
    print_text(&line)
}

/// The interactive approval menu.
fn approval_menu(
    app: &App,
    ws: &Workspace,
    task: &Task,
    close_flag: bool,
) -> Result<(), AtlasError> {
    let mut stderr = anstream::stderr();
    let _ = writeln!(
        stderr,
        "{}",
        info_message(cformat!(
            "Task <bold>{}</> in workspace <bold>{}</>: {}",
            task.id,
            ws.name,
            task.description
        ))
    );
    if let Some(url) = task.metadata.get("pr_url").and_then(|v| v.as_str()) {
        let _ = writeln!(stderr, "{}", info_message(cformat!("PR: <bold>{url}</>")));
    }

    loop {
        let _ = writeln!(
            stderr,
            "  [1] approve  [2] approve and close  [3] view diff  [4] view logs  [5] open PR  [6] reject  [7] cancel"
        );
        let choice = prompt("Choose an action: ")?;
        let action = match choice.as_str() {
            "1" => Some(ApprovalAction::Approve),
            "2" => Some(ApprovalAction::ApproveAndClose),
            "3" => Some(ApprovalAction::ViewDiff),
            "4" => Some(ApprovalAction::ViewLogs),
            "5" => Some(ApprovalAction::OpenPr),
            "6" => Some(ApprovalAction::Reject),
            "7" | "" => Some(ApprovalAction::Cancel),
            other => other.parse::<ApprovalAction>().ok(),
        };
        let Some(action) = action else {
            let _ = writeln!(
                stderr,
                "{}",
                warning_message(format!("Unknown action '{choice}'"))
            );
            continue;
        };

        match action {
            ApprovalAction::Approve => {
                let report = app.flow().approve(ws, task, close_flag)?;
                return render_report(&report, OutputFormat::Text);
            }
            ApprovalAction::ApproveAndClose => {
                let report = app.flow().approve(ws, task, true)?;
                return render_report(&report, OutputFormat::Text);
            }
            ApprovalAction::ViewDiff => {
                let diff = GitRunner.branch_diff(&ws.worktree_path, &app.config.forge.base_branch);
                match diff {
                    Ok(diff) if !diff.trim().is_empty() => {
                        print_text(&format_with_gutter(&diff, ""))?;
                    }
                    Ok(_) => print_text(&info_message("No changes against the base branch"))?,
                    Err(e) => print_text(&warning_message(e.plain_message()))?,
                }
            }
            ApprovalAction::ViewLogs => {
                let log = app.store.read_log(&ws.name, &task.id)?;
                if log.is_empty() {
                    print_text(&info_message("No log entries yet"))?;
                } else {
                    print_text(&format_with_gutter(&log, ""))?;
                }
            }
            ApprovalAction::OpenPr => match task.metadata.get("pr_url").and_then(|v| v.as_str()) {
                Some(url) => print_text(&info_message(cformat!("PR: <bold>{url}</>")))?,
                None => print_text(&warning_message("No PR recorded for this task"))?,
            },
            ApprovalAction::Reject => {
                return handle_reject(
                    app,
                    Some(ws.name.clone()),
                    false,
                    false,
                    None,
                    None,
                    OutputFormat::Text,
                );
            }
            ApprovalAction::Cancel => return Ok(()),
        }
    }
}

fn prompt(message: &str) -> Result<String, AtlasError> {
    let mut stderr = anstream::stderr();
    let _ = write!(stderr, "{PROMPT_EMOJI} {message}");
    let _ = stderr.flush();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|source| AtlasError::Io {
            context: "reading stdin".into(),
            source,
        })?;
    Ok(line.trim().to_string())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

pub fn handle_status(
    app: &App,
    watch: bool,
    interval: u64,
    progress: bool,
    format: OutputFormat,
) -> Result<(), AtlasError> {
    with_format(format, || {
        if watch && format.is_json() {
            return Err(AtlasError::WatchModeJsonUnsupported);
        }
        if watch && interval < 1 {
            return Err(AtlasError::WatchIntervalTooShort { min_secs: 1 });
        }

        if !watch {
            return render_status(app, progress, format);
        }
        loop {
            render_status(app, progress, format)?;
            std::thread::sleep(std::time::Duration::from_secs(interval));
        }
    })
}

fn render_status(app: &App, progress: bool, format: OutputFormat) -> Result<(), AtlasError> {
    let entries = app.manager().list()?;
    if format.is_json() {
        let mut workspaces = Vec::new();
        for entry in &entries {
            let tasks = app.store.list_tasks(&entry.workspace.name)?;
            workspaces.push(json!({
                "workspace": entry.workspace,
                "divergence": entry.divergence,
                "tasks": tasks,
            }));
        }
        return print_json(&json!({ "workspaces": workspaces }));
    }

    if entries.is_empty() {
        return print_text(&info_message("No workspaces yet; run 'atlas start <name>'"));
    }
    for entry in entries {
        let ws = &entry.workspace;
        print_text(&cformat!(
            "<bold>{}</> [{}] branch {}",
            ws.name,
            ws.status,
            ws.branch
        ))?;
        if let Some(divergence) = &entry.divergence {
            print_text(&warning_message(divergence))?;
        }
        for task in app.store.list_tasks(&ws.name)? {
            let step = task
                .current_step_ref()
                .map(|s| s.name.clone())
                .unwrap_or_else(|| "-".into());
            let progress_column = if progress {
                format!("  [{}/{}]", task.current_step, task.steps.len())
            } else {
                String::new()
            };
            print_text(&format!(
                "  {}  {:<18}  step {}{}  updated {}",
                task.id,
                task.status.to_string(),
                step,
                progress_column,
                task.updated_at.format("%Y-%m-%d %H:%M")
            ))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// validate / format / lint / test
// ---------------------------------------------------------------------------

pub fn handle_stage(
    app: &App,
    stage: Option<Stage>,
    args: &StageArgs,
) -> Result<(), AtlasError> {
    let format = args.output;
    with_format(format, || {
        let mut options = app.config.validation_options();
        if let Some(stage) = stage {
            options = options.only_stage(stage);
        }
        options.live_output = args.verbose && !format.is_json();

        let work_dir = std::env::current_dir().map_err(|source| AtlasError::Io {
            context: "resolving current directory".into(),
            source,
        })?;

        let cancel = CancelToken::new();
        register_interrupt(&cancel);

        let mut pipeline = ValidationPipeline::new(options, &work_dir);
        if args.verbose && !format.is_json() {
            let writer: SharedWriter = Arc::new(Mutex::new(std::io::stdout()));
            pipeline = pipeline.with_live_writer(writer);
        }

        let progress = |step: &str, status: ProgressStatus, info: &ProgressInfo| {
            let line = match status {
                ProgressStatus::Starting => {
                    progress_message(format!("{step} ({}/{})", info.current_step, info.total_steps))
                }
                ProgressStatus::Completed => success_message(step),
                ProgressStatus::Failed => warning_message(format!("{step} failed")),
                ProgressStatus::Skipped => info_message(format!("{step} skipped")),
            };
            let _ = print_text(&line);
        };
        let show_progress = !args.quiet && !format.is_json();
        let progress: atlas::validate::ProgressCallback<'_> = &progress;

        let result = pipeline.run(show_progress.then_some(progress), &cancel);
        render_pipeline_result(&result, format)
    })
}

fn render_pipeline_result(
    result: &PipelineResult,
    format: OutputFormat,
) -> Result<(), AtlasError> {
    if format.is_json() {
        print_json(&serde_json::to_value(result).map_err(|e| AtlasError::Io {
            context: "serializing pipeline result".into(),
            source: std::io::Error::other(e),
        })?)?;
        if result.success {
            return Ok(());
        }
        // The JSON document is the output; exit 1 without another message.
        return Err(AtlasError::JsonErrorOutput { code: 1 });
    }

    for command_result in result.results.iter().filter(|r| r.executed()) {
        if !command_result.success && command_result.exit_code != Some(127) {
            let stderr = command_result.stderr.trim();
            if !stderr.is_empty() {
                print_text(&format_with_gutter(stderr, ""))?;
            }
        }
    }
    for skipped in &result.skipped {
        print_text(&info_message(format!(
            "{} skipped: {}",
            skipped.step, skipped.reason
        )))?;
    }
    if result.success {
        print_text(&success_message("Validation passed"))
    } else {
        let stage = result
            .results
            .iter()
            .find(|r| !r.success && r.executed())
            .map(|r| r.stage.to_string())
            .unwrap_or_else(|| "validation".into());
        Err(AtlasError::ValidationFailed { stage })
    }
}

// ---------------------------------------------------------------------------
// checkpoint / cleanup / hook
// ---------------------------------------------------------------------------

pub fn handle_checkpoint(
    app: &App,
    description: Option<String>,
    trigger: &str,
    workspace: Option<String>,
) -> Result<(), AtlasError> {
    let trigger: CheckpointTrigger =
        trigger.parse().map_err(|_| AtlasError::InvalidArgument {
            message: format!("unknown checkpoint trigger '{trigger}'"),
        })?;
    let workspace = resolve_workspace(app, workspace)?;
    let task = active_task(app, &workspace)?;

    let mut hook = match app.hooks.get(&workspace, &task.id) {
        Ok(hook) => hook,
        Err(AtlasError::HookNotFound { .. }) => app.hooks.create(&task.id, &workspace)?,
        Err(e) => return Err(e),
    };
    let step = task
        .current_step_ref()
        .map(|s| (s.name.as_str(), task.current_step));
    let checkpoint = hook
        .add_checkpoint(trigger, description.as_deref(), step)
        .clone();
    app.hooks.save(&hook)?;
    print_text(&success_message(cformat!(
        "Recorded checkpoint <bold>{}</> ({})",
        checkpoint.id,
        checkpoint.trigger
    )))
}

pub fn handle_cleanup(
    app: &App,
    dry_run: bool,
    _hooks_only: bool,
    format: OutputFormat,
) -> Result<(), AtlasError> {
    with_format(format, || {
        let report = cleanup_hooks(&app.hooks, &app.config.retention(), dry_run)?;
        if format.is_json() {
            return print_json(&serde_json::to_value(&report).map_err(|e| AtlasError::Io {
                context: "serializing cleanup report".into(),
                source: std::io::Error::other(e),
            })?);
        }

        if report.candidates.is_empty() {
            return print_text(&info_message("No stale hooks"));
        }
        for candidate in &report.candidates {
            let action = if dry_run { "would delete" } else { "deleting" };
            print_text(&info_message(format!(
                "{action} hook {}/{} ({}, updated {})",
                candidate.workspace,
                candidate.task_id,
                candidate.state,
                candidate.updated_at.format("%Y-%m-%d")
            )))?;
        }
        // Partial failures are warnings; the command still exits 0.
        for warning in &report.warnings {
            print_text(&warning_message(warning))?;
        }
        if !dry_run {
            print_text(&success_message(format!("Deleted {} hooks", report.deleted)))?;
        }
        Ok(())
    })
}

pub fn handle_hook(app: &App, command: &HookCommand) -> Result<(), AtlasError> {
    match command {
        HookCommand::Status { workspace, output } => with_format(*output, || {
            let (workspace, task) = hook_target(app, workspace.clone())?;
            let hook = app.hooks.get(&workspace, &task.id)?;
            if output.is_json() {
                return print_json(&json!({ "hook": hook }));
            }
            print_text(&cformat!(
                "Hook for <bold>{}</>: state <bold>{}</>",
                hook.task_id,
                hook.state
            ))?;
            if let Some(step) = &hook.current_step {
                print_text(&format!(
                    "  current step: {} (index {}, attempt {}/{})",
                    step.name, step.index, step.attempt, step.max_attempts
                ))?;
            }
            print_text(&format!(
                "  {} checkpoints, {} receipts, {} events",
                hook.checkpoints.len(),
                hook.receipts.len(),
                hook.events.len()
            ))
        }),
        HookCommand::Checkpoints { workspace, output } => with_format(*output, || {
            let (workspace, task) = hook_target(app, workspace.clone())?;
            let hook = app.hooks.get(&workspace, &task.id)?;
            if output.is_json() {
                return print_json(&json!({ "checkpoints": hook.checkpoints }));
            }
            if hook.checkpoints.is_empty() {
                return print_text(&info_message("No checkpoints recorded"));
            }
            for cp in &hook.checkpoints {
                let step = cp.step_name.as_deref().unwrap_or("-");
                print_text(&format!(
                    "  {}  {}  {:<14} {}  {}",
                    cp.id,
                    cp.created_at.format("%Y-%m-%d %H:%M:%S"),
                    cp.trigger.to_string(),
                    step,
                    cp.description
                ))?;
            }
            Ok(())
        }),
        HookCommand::Install { workspace } => {
            let (workspace, task) = hook_target(app, workspace.clone())?;
            match app.hooks.get(&workspace, &task.id) {
                Ok(_) => print_text(&info_message("Hook already installed")),
                Err(AtlasError::HookNotFound { .. }) => {
                    app.hooks.create(&task.id, &workspace)?;
                    print_text(&success_message(cformat!(
                        "Installed hook for task <bold>{}</>",
                        task.id
                    )))
                }
                Err(e) => Err(e),
            }
        }
        HookCommand::VerifyReceipt {
            id,
            workspace,
            output,
        } => with_format(*output, || {
            let (workspace, task) = hook_target(app, workspace.clone())?;
            let hook = app.hooks.get(&workspace, &task.id)?;
            let receipt = hook
                .receipts
                .iter()
                .find(|r| r.id == *id)
                .ok_or_else(|| AtlasError::ReceiptNotFound { id: id.clone() })?;
            app.hooks.verify_receipt(receipt)?;
            if output.is_json() {
                return print_json(&json!({ "receipt": receipt, "verified": true }));
            }
            print_text(&success_message(cformat!(
                "Receipt <bold>{id}</> verified (key {})",
                receipt.key_fingerprint
            )))
        }),
        HookCommand::Regenerate { workspace } => {
            let (workspace, task) = hook_target(app, workspace.clone())?;
            let hook = app.hooks.get(&workspace, &task.id)?;
            app.hooks.save(&hook)?;
            print_text(&success_message("Regenerated HOOK.md from hook.json"))
        }
        HookCommand::Export { workspace } => {
            let (workspace, task) = hook_target(app, workspace.clone())?;
            let hook = app.hooks.get(&workspace, &task.id)?;
            print_json(&serde_json::to_value(&hook).map_err(|e| AtlasError::Io {
                context: "serializing hook".into(),
                source: std::io::Error::other(e),
            })?)
        }
    }
}

// ---------------------------------------------------------------------------
// workspace
// ---------------------------------------------------------------------------

pub fn handle_workspace(app: &App, command: &WorkspaceCommand) -> Result<(), AtlasError> {
    match command {
        WorkspaceCommand::List { output } => with_format(*output, || {
            let entries = app.manager().list()?;
            if output.is_json() {
                let rows: Vec<_> = entries
                    .iter()
                    .map(|e| json!({ "workspace": e.workspace, "divergence": e.divergence }))
                    .collect();
                return print_json(&json!({ "workspaces": rows }));
            }
            if entries.is_empty() {
                return print_text(&info_message("No workspaces"));
            }
            for entry in entries {
                let ws = &entry.workspace;
                print_text(&cformat!(
                    "<bold>{}</>  [{}]  {}  {} tasks",
                    ws.name,
                    ws.status,
                    ws.branch,
                    ws.tasks.len()
                ))?;
                if let Some(divergence) = &entry.divergence {
                    print_text(&warning_message(divergence))?;
                }
            }
            Ok(())
        }),
        WorkspaceCommand::Retire { name, output } => with_format(*output, || {
            let outcome = app.manager().retire(name)?;
            if output.is_json() {
                return print_json(&json!({
                    "workspace": outcome.workspace,
                    "warnings": outcome.warnings,
                }));
            }
            for warning in &outcome.warnings {
                print_text(&warning_message(warning))?;
            }
            print_text(&success_message(cformat!(
                "Workspace <bold>{name}</> retired"
            )))
        }),
        WorkspaceCommand::Close { name } => {
            app.manager().close(name)?;
            print_text(&success_message(cformat!("Workspace <bold>{name}</> closed")))
        }
        WorkspaceCommand::Reopen { name } => {
            app.manager().reopen(name)?;
            print_text(&success_message(cformat!(
                "Workspace <bold>{name}</> reopened"
            )))
        }
        WorkspaceCommand::Destroy { name, force } => {
            if !*force {
                if !std::io::stdin().is_terminal() {
                    return Err(AtlasError::InvalidArgument {
                        message: "destroy needs --force when not run interactively".into(),
                    });
                }
                let answer = prompt(&format!(
                    "Type the workspace name to confirm destroying '{name}': "
                ))?;
                if answer != *name {
                    return Err(AtlasError::InvalidArgument {
                        message: "confirmation did not match; nothing destroyed".into(),
                    });
                }
            }
            let warnings = app.manager().destroy(name)?;
            for warning in &warnings {
                print_text(&warning_message(warning))?;
            }
            print_text(&success_message(cformat!(
                "Workspace <bold>{name}</> destroyed"
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// shared resolution helpers
// ---------------------------------------------------------------------------

/// Resolve the target workspace: explicit flag, then the worktree the
/// current directory is inside, then the only workspace with live tasks.
fn resolve_workspace(app: &App, workspace: Option<String>) -> Result<String, AtlasError> {
    if let Some(name) = workspace {
        if !app.store.workspace_exists(&name) {
            return Err(AtlasError::WorkspaceNotFound { name });
        }
        return Ok(name);
    }

    let workspaces = app.store.list_workspaces()?;
    if let Ok(cwd) = std::env::current_dir()
        && let Some(ws) = workspaces.iter().find(|ws| cwd.starts_with(&ws.worktree_path))
    {
        return Ok(ws.name.clone());
    }

    let mut live: Vec<&Workspace> = workspaces
        .iter()
        .filter(|ws| ws.non_terminal_tasks().next().is_some())
        .collect();
    match live.len() {
        1 => Ok(live.pop().expect("non-empty").name.clone()),
        0 => Err(AtlasError::NoTasksFound { workspace: None }),
        _ => Err(AtlasError::InvalidArgument {
            message: "multiple workspaces have active tasks; pass --workspace".into(),
        }),
    }
}

/// The workspace's most relevant task: latest non-terminal, else latest.
fn active_task(app: &App, workspace: &str) -> Result<Task, AtlasError> {
    let tasks = app.store.list_tasks(workspace)?;
    tasks
        .iter()
        .filter(|t| !t.status.is_terminal())
        .max_by_key(|t| t.updated_at)
        .or_else(|| tasks.iter().max_by_key(|t| t.updated_at))
        .cloned()
        .ok_or(AtlasError::NoTasksFound {
            workspace: Some(workspace.to_string()),
        })
}

fn hook_target(app: &App, workspace: Option<String>) -> Result<(String, Task), AtlasError> {
    let workspace = resolve_workspace(app, workspace)?;
    let task = active_task(app, &workspace)?;
    Ok((workspace, task))
}
