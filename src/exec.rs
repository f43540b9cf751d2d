//! Shell selection and the single choke-point for external commands.
//!
//! All subprocess execution goes through [`run`] so every command gets the
//! same debug logging and timing trace:
//!
//! ```text
//! $ git push [auth]            # with context
//! $ gh pr create               # without context
//! [atlas-trace] cmd="..." dur=12.3ms ok=true
//! ```

use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;

static SHELL_CONFIG: OnceLock<ShellConfig> = OnceLock::new();

/// Shell used to interpret configured command strings.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
}

impl ShellConfig {
    /// `sh -c` on unix, PowerShell on Windows.
    pub fn get() -> &'static ShellConfig {
        SHELL_CONFIG.get_or_init(|| {
            #[cfg(unix)]
            {
                ShellConfig {
                    executable: PathBuf::from("sh"),
                    args: vec!["-c".to_string()],
                }
            }
            #[cfg(windows)]
            {
                ShellConfig {
                    executable: PathBuf::from("powershell.exe"),
                    args: vec!["-NoProfile".to_string(), "-Command".to_string()],
                }
            }
        })
    }

    /// Create a Command that passes `shell_command` to the shell.
    pub fn command(&self, shell_command: &str) -> Command {
        let mut cmd = Command::new(&self.executable);
        for arg in &self.args {
            cmd.arg(arg);
        }
        cmd.arg(shell_command);
        cmd
    }
}

/// Render a command for logging.
pub fn display_command(cmd: &Command) -> String {
    let program = cmd.get_program().to_string_lossy();
    let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy()).collect();
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Execute a command with timing and debug logging.
///
/// The `context` parameter is typically the workspace name for git commands,
/// or `None` for standalone tools like `gh`.
pub fn run(cmd: &mut Command, context: Option<&str>) -> std::io::Result<std::process::Output> {
    use std::time::Instant;

    let cmd_str = display_command(cmd);
    match context {
        Some(ctx) => log::debug!("$ {} [{}]", cmd_str, ctx),
        None => log::debug!("$ {}", cmd_str),
    }

    let t0 = Instant::now();
    let result = cmd.output();
    let duration_ms = t0.elapsed().as_secs_f64() * 1000.0;

    match &result {
        Ok(output) => {
            log::debug!(
                "[atlas-trace] cmd=\"{}\" dur={:.1}ms ok={}",
                cmd_str,
                duration_ms,
                output.status.success()
            );
        }
        Err(e) => {
            log::debug!(
                "[atlas-trace] cmd=\"{}\" dur={:.1}ms err=\"{}\"",
                cmd_str,
                duration_ms,
                e
            );
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_shell_command_execution() {
        let output = ShellConfig::get()
            .command("echo hello")
            .output()
            .expect("echo should spawn");
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }

    #[test]
    fn test_display_command() {
        let mut cmd = Command::new("git");
        cmd.arg("status").arg("--short");
        assert_eq!(display_command(&cmd), "git status --short");
    }
}
