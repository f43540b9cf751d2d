//! The validation pipeline: a bounded, partially-parallel command
//! orchestrator with live progress and cancellation.
//!
//! Execution order:
//!
//! 1. **format** - sequential
//! 2. **lint** and **test** - concurrent, sharing the cancellation scope
//! 3. **pre-commit** - sequential
//!
//! A stage with no configured commands is skipped without failing the
//! aggregate. Exit code 127 ("command not found") marks that command
//! skipped with reason `tool not installed` instead of failing.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use wait_timeout::ChildExt;

use crate::exec::ShellConfig;

/// Exit code shells report for a missing command.
pub const TOOL_NOT_INSTALLED_EXIT: i32 = 127;

/// Poll granularity while waiting on a child process.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Grace period between SIGINT and SIGKILL on cancellation.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    Format,
    Lint,
    Test,
    PreCommit,
}

/// Outcome of a single command (or a stage-level skip placeholder with an
/// empty `command`).
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub stage: Stage,
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    fn stage_skip(stage: Stage) -> Self {
        Self {
            stage,
            command: String::new(),
            success: true,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            error: None,
        }
    }

    /// True when a process actually ran to an exit status.
    pub fn executed(&self) -> bool {
        !self.command.is_empty() && self.exit_code.is_some()
    }

    fn tool_missing(&self) -> bool {
        self.exit_code == Some(TOOL_NOT_INSTALLED_EXIT)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedStep {
    pub step: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    pub results: Vec<CommandResult>,
    pub skipped: Vec<SkippedStep>,
}

impl PipelineResult {
    pub fn skipped_steps(&self) -> Vec<&str> {
        self.skipped.iter().map(|s| s.step.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ProgressStatus {
    Starting,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressInfo {
    /// 1-based index of this command among all commands in the run.
    pub current_step: usize,
    pub total_steps: usize,
    pub duration_ms: Option<u64>,
}

/// Progress callbacks fire from worker threads and must be thread-safe.
pub type ProgressCallback<'a> = &'a (dyn Fn(&str, ProgressStatus, &ProgressInfo) + Sync);

/// Cooperative cancellation shared by every in-flight command.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// The underlying flag, for signal-handler registration.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner)
    }
}

/// Thread-safe sink for live command output.
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Configured stage commands and execution options.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    pub format: Vec<String>,
    pub lint: Vec<String>,
    pub test: Vec<String>,
    pub pre_commit: Vec<String>,
    /// Per-command timeout.
    pub timeout: Duration,
    pub live_output: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            format: Vec::new(),
            lint: Vec::new(),
            test: Vec::new(),
            pre_commit: Vec::new(),
            timeout: Duration::from_secs(300),
            live_output: false,
        }
    }
}

impl ValidationOptions {
    pub fn commands_for(&self, stage: Stage) -> &[String] {
        match stage {
            Stage::Format => &self.format,
            Stage::Lint => &self.lint,
            Stage::Test => &self.test,
            Stage::PreCommit => &self.pre_commit,
        }
    }

    /// Restrict to a single stage (the `format`/`lint`/`test` CLI commands).
    pub fn only_stage(mut self, stage: Stage) -> Self {
        let keep = self.commands_for(stage).to_vec();
        self.format = Vec::new();
        self.lint = Vec::new();
        self.test = Vec::new();
        self.pre_commit = Vec::new();
        match stage {
            Stage::Format => self.format = keep,
            Stage::Lint => self.lint = keep,
            Stage::Test => self.test = keep,
            Stage::PreCommit => self.pre_commit = keep,
        }
        self
    }

    fn total_commands(&self) -> usize {
        self.format.len() + self.lint.len() + self.test.len() + self.pre_commit.len()
    }
}

/// Runs the configured stages in a working directory.
pub struct ValidationPipeline {
    options: ValidationOptions,
    work_dir: PathBuf,
    live_writer: Option<SharedWriter>,
}

impl ValidationPipeline {
    pub fn new(options: ValidationOptions, work_dir: &Path) -> Self {
        Self {
            options,
            work_dir: work_dir.to_path_buf(),
            live_writer: None,
        }
    }

    /// Forward command output line-by-line to `writer` (verbose mode).
    pub fn with_live_writer(mut self, writer: SharedWriter) -> Self {
        self.live_writer = Some(writer);
        self
    }

    /// Run all stages. Partial results still reach the caller after a
    /// cancellation.
    pub fn run(&self, progress: Option<ProgressCallback<'_>>, cancel: &CancelToken) -> PipelineResult {
        let total = self.options.total_commands();
        let counter = AtomicUsize::new(0);

        let mut results = Vec::new();
        let mut skipped = Vec::new();
        let mut stage_failed = false;

        // Format: sequential, all entries.
        self.run_stage_or_skip(
            Stage::Format,
            progress,
            cancel,
            &counter,
            total,
            &mut results,
            &mut skipped,
            &mut stage_failed,
        );

        // Lint and test: concurrent, one worker per stage. A failure in one
        // does not cancel the other; the barrier waits for both.
        let (lint_outcome, test_outcome) = std::thread::scope(|scope| {
            let lint_handle =
                scope.spawn(|| self.run_stage(Stage::Lint, progress, cancel, &counter, total));
            let test_handle =
                scope.spawn(|| self.run_stage(Stage::Test, progress, cancel, &counter, total));
            (lint_handle.join(), test_handle.join())
        });
        for outcome in [lint_outcome, test_outcome] {
            match outcome {
                Ok(stage_outcome) => {
                    stage_failed |= stage_outcome.failed;
                    results.extend(stage_outcome.results);
                    skipped.extend(stage_outcome.skipped);
                }
                Err(_) => {
                    stage_failed = true;
                }
            }
        }

        // Pre-commit: sequential, only when nothing upstream failed.
        if stage_failed && !self.options.pre_commit.is_empty() {
            self.skip_stage(
                Stage::PreCommit,
                "previous stage failed",
                progress,
                &counter,
                total,
                &mut results,
                &mut skipped,
            );
        } else {
            self.run_stage_or_skip(
                Stage::PreCommit,
                progress,
                cancel,
                &counter,
                total,
                &mut results,
                &mut skipped,
                &mut stage_failed,
            );
        }

        // Aggregate: false if any non-skipped command failed.
        let success = !results
            .iter()
            .any(|r| !r.success && !r.tool_missing() && !r.command.is_empty());

        PipelineResult {
            success,
            results,
            skipped,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_stage_or_skip(
        &self,
        stage: Stage,
        progress: Option<ProgressCallback<'_>>,
        cancel: &CancelToken,
        counter: &AtomicUsize,
        total: usize,
        results: &mut Vec<CommandResult>,
        skipped: &mut Vec<SkippedStep>,
        stage_failed: &mut bool,
    ) {
        let outcome = self.run_stage(stage, progress, cancel, counter, total);
        *stage_failed |= outcome.failed;
        results.extend(outcome.results);
        skipped.extend(outcome.skipped);
    }

    #[allow(clippy::too_many_arguments)]
    fn skip_stage(
        &self,
        stage: Stage,
        reason: &str,
        progress: Option<ProgressCallback<'_>>,
        counter: &AtomicUsize,
        total: usize,
        results: &mut Vec<CommandResult>,
        skipped: &mut Vec<SkippedStep>,
    ) {
        if let Some(cb) = progress {
            let info = ProgressInfo {
                current_step: counter.load(Ordering::SeqCst),
                total_steps: total,
                duration_ms: None,
            };
            cb(&stage.to_string(), ProgressStatus::Skipped, &info);
        }
        results.push(CommandResult::stage_skip(stage));
        skipped.push(SkippedStep {
            step: stage.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Run one stage's commands sequentially, stopping the stage on the
    /// first real failure.
    fn run_stage(
        &self,
        stage: Stage,
        progress: Option<ProgressCallback<'_>>,
        cancel: &CancelToken,
        counter: &AtomicUsize,
        total: usize,
    ) -> StageOutcome {
        let stage_name = stage.to_string();
        let commands = self.options.commands_for(stage);

        let mut outcome = StageOutcome::default();
        if commands.is_empty() {
            if let Some(cb) = progress {
                let info = ProgressInfo {
                    current_step: counter.load(Ordering::SeqCst),
                    total_steps: total,
                    duration_ms: None,
                };
                cb(&stage_name, ProgressStatus::Skipped, &info);
            }
            outcome.results.push(CommandResult::stage_skip(stage));
            outcome.skipped.push(SkippedStep {
                step: stage_name,
                reason: "no command configured".to_string(),
            });
            return outcome;
        }

        for command in commands {
            if cancel.is_cancelled() {
                outcome.skipped.push(SkippedStep {
                    step: stage_name.clone(),
                    reason: "cancelled".to_string(),
                });
                break;
            }

            let current_step = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(cb) = progress {
                let info = ProgressInfo {
                    current_step,
                    total_steps: total,
                    duration_ms: None,
                };
                cb(&stage_name, ProgressStatus::Starting, &info);
            }

            let result = self.run_command(stage, command, cancel);
            let info = ProgressInfo {
                current_step,
                total_steps: total,
                duration_ms: Some(result.duration_ms),
            };

            if result.tool_missing() {
                if let Some(cb) = progress {
                    cb(&stage_name, ProgressStatus::Skipped, &info);
                }
                outcome.skipped.push(SkippedStep {
                    step: stage_name.clone(),
                    reason: "tool not installed".to_string(),
                });
                outcome.results.push(result);
                continue;
            }

            let failed = !result.success;
            if let Some(cb) = progress {
                let status = if failed {
                    ProgressStatus::Failed
                } else {
                    ProgressStatus::Completed
                };
                cb(&stage_name, status, &info);
            }
            outcome.results.push(result);
            if failed {
                // First failed command ends this subpipeline.
                outcome.failed = true;
                break;
            }
        }
        outcome
    }

    fn run_command(&self, stage: Stage, command: &str, cancel: &CancelToken) -> CommandResult {
        let started = Instant::now();
        log::debug!("$ {} [{}]", command, stage);

        let mut child = match ShellConfig::get()
            .command(command)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let not_found = e.kind() == std::io::ErrorKind::NotFound;
                return CommandResult {
                    stage,
                    command: command.to_string(),
                    success: false,
                    exit_code: not_found.then_some(TOOL_NOT_INSTALLED_EXIT),
                    stdout: String::new(),
                    stderr: String::new(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(format!("failed to spawn: {e}")),
                };
            }
        };

        let stdout_reader = spawn_reader(child.stdout.take(), self.live_sink());
        let stderr_reader = spawn_reader(child.stderr.take(), self.live_sink());

        let deadline = started + self.options.timeout;
        let mut error = None;
        let status = loop {
            match child.wait_timeout(WAIT_SLICE) {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if cancel.is_cancelled() {
                        error = Some("cancelled".to_string());
                        interrupt_then_kill(&mut child);
                        break child.wait().ok();
                    }
                    if Instant::now() >= deadline {
                        error = Some("timeout".to_string());
                        let _ = child.kill();
                        break child.wait().ok();
                    }
                }
                Err(e) => {
                    error = Some(format!("wait failed: {e}"));
                    let _ = child.kill();
                    break child.wait().ok();
                }
            }
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        let exit_code = status.and_then(|s| s.code());
        let success = error.is_none() && status.is_some_and(|s| s.success());

        CommandResult {
            stage,
            command: command.to_string(),
            success,
            exit_code,
            stdout,
            stderr,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        }
    }

    fn live_sink(&self) -> Option<SharedWriter> {
        if self.options.live_output {
            self.live_writer.clone()
        } else {
            None
        }
    }
}

#[derive(Default)]
struct StageOutcome {
    results: Vec<CommandResult>,
    skipped: Vec<SkippedStep>,
    failed: bool,
}

/// Drain a child pipe on its own thread, optionally forwarding each line to
/// the live writer.
fn spawn_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
    live: Option<SharedWriter>,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let Some(pipe) = pipe else {
            return String::new();
        };
        let mut collected = String::new();
        for line in BufReader::new(pipe).lines() {
            let Ok(line) = line else { break };
            if let Some(writer) = &live
                && let Ok(mut w) = writer.lock()
            {
                let _ = writeln!(w, "{line}");
            }
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    })
}

/// SIGINT first, SIGKILL after a grace period.
fn interrupt_then_kill(child: &mut std::process::Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let pid = Pid::from_raw(child.id() as i32);
        if kill(pid, Signal::SIGINT).is_ok() {
            let deadline = Instant::now() + KILL_GRACE;
            while Instant::now() < deadline {
                match child.wait_timeout(WAIT_SLICE) {
                    Ok(Some(_)) => return,
                    Ok(None) => {}
                    Err(_) => break,
                }
            }
        }
    }
    let _ = child.kill();
}
