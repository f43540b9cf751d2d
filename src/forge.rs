//! Forge operations (pull requests, CI runs) via the hosting provider CLI.
//!
//! Queries go through `gh` in non-interactive batch mode so the tool never
//! prompts, never paginates, and never opens a browser.

use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use crate::error::AtlasError;
use crate::exec;

/// Aggregate CI state for a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CiOutcome {
    Pending,
    Passing,
    Failing,
}

/// The forge capability the core consumes.
pub trait ForgeClient: Send + Sync {
    /// Open a pull request, returning its URL.
    fn create_pr(
        &self,
        dir: &Path,
        title: &str,
        body: &str,
        base: &str,
    ) -> Result<String, AtlasError>;
    /// Aggregate CI status for the branch's open PR.
    fn ci_status(&self, dir: &Path, branch: &str) -> Result<CiOutcome, AtlasError>;
}

#[derive(Debug, Deserialize)]
struct CheckRun {
    state: String,
}

/// Shells out to the `gh` CLI.
#[derive(Debug, Clone)]
pub struct GhClient {
    program: String,
}

impl Default for GhClient {
    fn default() -> Self {
        Self {
            program: "gh".to_string(),
        }
    }
}

impl GhClient {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    /// A Command configured for non-interactive batch execution. Prevents
    /// `gh` from prompting, using TTY formatting, or opening browsers.
    fn non_interactive(&self, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(dir)
            .env_remove("GH_FORCE_TTY")
            .env_remove("CLICOLOR_FORCE")
            .env("NO_COLOR", "1")
            .env("CLICOLOR", "0")
            .env("GH_PROMPT_DISABLED", "1");
        cmd
    }

    fn run(&self, mut cmd: Command) -> Result<std::process::Output, AtlasError> {
        if which::which(&self.program).is_err() {
            return Err(AtlasError::UnknownTool {
                name: self.program.clone(),
            });
        }
        let display = exec::display_command(&cmd);
        exec::run(&mut cmd, None).map_err(|e| AtlasError::CommandFailed {
            command: display,
            exit_code: None,
            stderr: e.to_string(),
        })
    }
}

impl ForgeClient for GhClient {
    fn create_pr(
        &self,
        dir: &Path,
        title: &str,
        body: &str,
        base: &str,
    ) -> Result<String, AtlasError> {
        let mut cmd = self.non_interactive(dir);
        cmd.args(["pr", "create", "--title", title, "--body", body, "--base", base]);
        let display = exec::display_command(&cmd);
        let output = self.run(cmd)?;
        if !output.status.success() {
            return Err(AtlasError::CommandFailed {
                command: display,
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        // gh prints the PR URL as the last line of stdout.
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .rev()
            .find(|line| line.starts_with("http"))
            .map(str::to_string)
            .ok_or_else(|| AtlasError::CommandFailed {
                command: display,
                exit_code: output.status.code(),
                stderr: "gh did not print a PR URL".to_string(),
            })
    }

    fn ci_status(&self, dir: &Path, branch: &str) -> Result<CiOutcome, AtlasError> {
        let mut cmd = self.non_interactive(dir);
        cmd.args(["pr", "checks", branch, "--json", "state"]);
        let display = exec::display_command(&cmd);
        let output = self.run(cmd)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // `gh pr checks` exits 8 while checks are still pending.
            if output.status.code() == Some(8) {
                return Ok(CiOutcome::Pending);
            }
            return Err(AtlasError::CommandFailed {
                command: display,
                exit_code: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        let checks: Vec<CheckRun> =
            serde_json::from_slice(&output.stdout).map_err(|e| AtlasError::CommandFailed {
                command: display,
                exit_code: output.status.code(),
                stderr: format!("failed to parse gh JSON: {e}"),
            })?;
        Ok(aggregate_checks(&checks))
    }
}

fn aggregate_checks(checks: &[CheckRun]) -> CiOutcome {
    let mut pending = false;
    for check in checks {
        match check.state.as_str() {
            "FAILURE" | "ERROR" | "CANCELLED" | "TIMED_OUT" | "ACTION_REQUIRED" => {
                return CiOutcome::Failing;
            }
            "PENDING" | "QUEUED" | "IN_PROGRESS" | "WAITING" | "REQUESTED" | "STALE" => {
                pending = true;
            }
            _ => {}
        }
    }
    if pending {
        CiOutcome::Pending
    } else {
        CiOutcome::Passing
    }
}
