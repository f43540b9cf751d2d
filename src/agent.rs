//! The AI agent subprocess and its prompt templates.
//!
//! The agent is an external command fed a prompt on stdin. Its stdout is
//! streamed line-by-line (so long runs stay observable) and collected as the
//! step's output. Non-zero exit is fatal; the engine decides how to surface
//! it.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use minijinja::{Environment, context};

use crate::error::AtlasError;
use crate::validate::SharedWriter;

/// Default template for implementation-step prompts.
const DEFAULT_STEP_TEMPLATE: &str = r#"You are working in an isolated git worktree for workspace "{{ workspace }}" on branch "{{ branch }}".

Task: {{ description }}
{% if rejection_feedback %}
A previous attempt was rejected with this feedback. Address it before anything else:

{{ rejection_feedback }}
{% endif %}
{% if artifacts %}
Artifacts from earlier steps are available:
{% for artifact in artifacts %}
- {{ artifact }}
{% endfor %}
{% endif %}
Make the code changes required by the task. Do not commit; the orchestrator
handles commits, validation, and the pull request.
"#;

/// Default template for commit-message prompts.
const DEFAULT_COMMIT_TEMPLATE: &str = r#"Generate a commit message for the staged changes below. Output only the message.

Format
- First line: <50 chars, present tense, describes WHAT and WHY (not HOW).
- Blank line after first line.
- Optional details explaining context.
- Broadly match the style of the previous commit messages.

<git-diff>
```
{{ git_diff }}
```
</git-diff>

<git-info>
  <current-branch>{{ branch }}</current-branch>
{% if recent_commits %}
  <previous-commit-message-titles>
{% for commit in recent_commits %}
    <previous-commit-message-title>{{ commit }}</previous-commit-message-title>
{% endfor %}
  </previous-commit-message-titles>
{% endif %}
</git-info>
"#;

/// Variables available to the step prompt template.
#[derive(Debug)]
pub struct StepPromptContext<'a> {
    pub description: &'a str,
    pub workspace: &'a str,
    pub branch: &'a str,
    pub rejection_feedback: Option<&'a str>,
    pub artifacts: &'a [String],
}

fn render(template: &str, ctx: minijinja::Value) -> Result<String, AtlasError> {
    let mut env = Environment::new();
    env.add_template("prompt", template)
        .map_err(|e| AtlasError::InvalidArgument {
            message: format!("invalid prompt template: {e}"),
        })?;
    let tmpl = env.get_template("prompt").expect("template was just added");
    tmpl.render(ctx).map_err(|e| AtlasError::InvalidArgument {
        message: format!("failed to render prompt template: {e}"),
    })
}

/// Build the implementation-step prompt. `template` overrides the default.
pub fn build_step_prompt(
    template: Option<&str>,
    ctx: &StepPromptContext<'_>,
) -> Result<String, AtlasError> {
    render(
        template.unwrap_or(DEFAULT_STEP_TEMPLATE),
        context! {
            description => ctx.description,
            workspace => ctx.workspace,
            branch => ctx.branch,
            rejection_feedback => ctx.rejection_feedback,
            artifacts => ctx.artifacts,
        },
    )
}

/// Build the commit-message prompt over the staged diff.
pub fn build_commit_prompt(
    template: Option<&str>,
    git_diff: &str,
    branch: &str,
    recent_commits: &[String],
) -> Result<String, AtlasError> {
    render(
        template.unwrap_or(DEFAULT_COMMIT_TEMPLATE),
        context! {
            git_diff => git_diff,
            branch => branch,
            recent_commits => recent_commits,
        },
    )
}

/// The AI agent capability the executors consume.
pub trait AgentRunner: Send + Sync {
    /// Run the agent with `prompt` on stdin in `work_dir`, streaming stdout
    /// to `live` when given. Returns the collected stdout.
    fn run(
        &self,
        prompt: &str,
        work_dir: &Path,
        live: Option<SharedWriter>,
    ) -> Result<String, AtlasError>;
}

/// Spawns the configured agent command.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: &str, args: &[String]) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
        }
    }
}

impl AgentRunner for CommandAgent {
    fn run(
        &self,
        prompt: &str,
        work_dir: &Path,
        live: Option<SharedWriter>,
    ) -> Result<String, AtlasError> {
        let display = if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        };
        log::debug!("$ {} [agent]", display);

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| AtlasError::CommandFailed {
            command: display.clone(),
            exit_code: None,
            stderr: format!("failed to spawn agent: {e}"),
        })?;

        // Some commands exit without reading stdin; BrokenPipe is fine as
        // long as they produce output.
        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(prompt.as_bytes())
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(AtlasError::CommandFailed {
                command: display,
                exit_code: None,
                stderr: format!("failed to write prompt to agent stdin: {e}"),
            });
        }

        // Drain stderr on its own thread so a chatty agent cannot fill the
        // pipe and deadlock while stdout is being streamed.
        let stderr_handle = child.stderr.take().map(|stderr| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let mut reader = BufReader::new(stderr);
                let _ = std::io::Read::read_to_string(&mut reader, &mut buf);
                buf
            })
        });

        // Stream stdout while collecting it.
        let mut collected = String::new();
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if let Some(writer) = &live
                    && let Ok(mut w) = writer.lock()
                {
                    let _ = writeln!(w, "{line}");
                }
                collected.push_str(&line);
                collected.push('\n');
            }
        }

        let status = child.wait().map_err(|e| AtlasError::CommandFailed {
            command: display.clone(),
            exit_code: None,
            stderr: format!("failed to wait for agent: {e}"),
        })?;
        let stderr = stderr_handle
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(AtlasError::CommandFailed {
                command: display,
                exit_code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        let collected = collected.trim().to_string();
        if collected.is_empty() {
            return Err(AtlasError::CommandFailed {
                command: display,
                exit_code: status.code(),
                stderr: "agent produced no output".to_string(),
            });
        }

        Ok(collected)
    }
}
