//! Error types, stable error kinds, and exit-code mapping.
//!
//! Every error that can cross the CLI boundary has a stable `kind` string
//! surfaced in JSON output. Display impls carry the styled human rendering;
//! programmatic callers match on the variant or on [`AtlasError::kind`].

use serde_json::json;

use crate::styling::{ERROR_EMOJI, HINT_EMOJI};
use color_print::cformat;

/// Closed set of application errors.
///
/// Variants map 1:1 to the stable kind identifiers surfaced in JSON mode.
/// Statuses are carried as plain strings so this module stays leaf-level.
#[derive(Debug)]
pub enum AtlasError {
    WorkspaceNotFound {
        name: String,
    },
    TaskNotFound {
        workspace: String,
        task_id: String,
    },
    ArtifactNotFound {
        name: String,
    },
    HookNotFound {
        task_id: String,
    },
    ReceiptNotFound {
        id: String,
    },
    /// A `(status, next_status)` pair outside the permitted transition set
    InvalidTransition {
        from: String,
        to: String,
    },
    NoTasksFound {
        workspace: Option<String>,
    },
    WorkspaceHasRunningTasks {
        name: String,
    },
    InvalidArgument {
        message: String,
    },
    InvalidOutputFormat {
        value: String,
    },
    InvalidToolName {
        value: String,
    },
    /// A required value was empty (e.g. rejection feedback)
    EmptyValue {
        field: String,
    },
    InteractiveRequired {
        message: String,
    },
    /// External command exited non-zero or could not be spawned
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    /// The validation pipeline reported an aggregate failure
    ValidationFailed {
        stage: String,
    },
    WatchIntervalTooShort {
        min_secs: u64,
    },
    WatchModeJsonUnsupported,
    /// Sentinel: a JSON error document was already written to stdout.
    /// The process must exit with `code` without printing anything else.
    JsonErrorOutput {
        code: i32,
    },
    Io {
        context: String,
        source: std::io::Error,
    },
    UnknownTool {
        name: String,
    },
}

impl AtlasError {
    /// Stable kind identifier, surfaced as `error.kind` in JSON mode.
    pub fn kind(&self) -> &'static str {
        match self {
            AtlasError::WorkspaceNotFound { .. } => "workspace_not_found",
            AtlasError::TaskNotFound { .. } => "task_not_found",
            AtlasError::ArtifactNotFound { .. } => "artifact_not_found",
            AtlasError::HookNotFound { .. } => "hook_not_found",
            AtlasError::ReceiptNotFound { .. } => "receipt_not_found",
            AtlasError::InvalidTransition { .. } => "invalid_transition",
            AtlasError::NoTasksFound { .. } => "no_tasks_found",
            AtlasError::WorkspaceHasRunningTasks { .. } => "workspace_has_running_tasks",
            AtlasError::InvalidArgument { .. } => "invalid_argument",
            AtlasError::InvalidOutputFormat { .. } => "invalid_output_format",
            AtlasError::InvalidToolName { .. } => "invalid_tool_name",
            AtlasError::EmptyValue { .. } => "empty_value",
            AtlasError::InteractiveRequired { .. } => "interactive_required",
            AtlasError::CommandFailed { .. } => "command_failed",
            AtlasError::ValidationFailed { .. } => "validation_failed",
            AtlasError::WatchIntervalTooShort { .. } => "watch_interval_too_short",
            AtlasError::WatchModeJsonUnsupported => "watch_mode_json_unsupported",
            AtlasError::JsonErrorOutput { .. } => "json_error_output",
            AtlasError::Io { .. } => "io_failure",
            AtlasError::UnknownTool { .. } => "unknown_tool",
        }
    }

    /// Process exit code for this error.
    ///
    /// Invalid user input maps to 2, everything else to 1. The JSON sentinel
    /// carries the code of the error it stands in for.
    pub fn exit_code(&self) -> i32 {
        match self {
            AtlasError::InvalidArgument { .. }
            | AtlasError::InvalidOutputFormat { .. }
            | AtlasError::InvalidToolName { .. }
            | AtlasError::InteractiveRequired { .. } => 2,
            AtlasError::JsonErrorOutput { code } => *code,
            _ => 1,
        }
    }

    /// Optional hint shown under the error in text mode.
    fn hint(&self) -> Option<String> {
        match self {
            AtlasError::WorkspaceNotFound { .. } => {
                Some("Run 'atlas workspace list' to see known workspaces".into())
            }
            AtlasError::NoTasksFound { .. } => {
                Some("Start one with 'atlas start <workspace>'".into())
            }
            AtlasError::WorkspaceHasRunningTasks { .. } => {
                Some("Finish, approve, or abandon the running tasks first".into())
            }
            AtlasError::InteractiveRequired { .. } => {
                Some("Pass an explicit workspace argument in non-interactive mode".into())
            }
            AtlasError::EmptyValue { field } => Some(format!("Provide a non-empty {field}")),
            AtlasError::WatchIntervalTooShort { min_secs } => {
                Some(format!("Use --interval {min_secs} or higher"))
            }
            AtlasError::WatchModeJsonUnsupported => {
                Some("Drop --watch or use --output text".into())
            }
            _ => None,
        }
    }

    /// Render the single JSON error document for `--output json` mode.
    pub fn to_json(&self) -> serde_json::Value {
        let mut doc = json!({
            "error": {
                "kind": self.kind(),
                "message": self.plain_message(),
            }
        });
        if let Some(hint) = self.hint() {
            doc["error"]["suggestion"] = json!(hint);
        }
        doc
    }

    /// The unstyled message body (no emoji, no ANSI).
    pub fn plain_message(&self) -> String {
        match self {
            AtlasError::WorkspaceNotFound { name } => format!("Workspace '{name}' not found"),
            AtlasError::TaskNotFound { workspace, task_id } => {
                format!("Task '{task_id}' not found in workspace '{workspace}'")
            }
            AtlasError::ArtifactNotFound { name } => format!("Artifact '{name}' not found"),
            AtlasError::HookNotFound { task_id } => {
                format!("No hook recorded for task '{task_id}'")
            }
            AtlasError::ReceiptNotFound { id } => format!("No validation receipt '{id}'"),
            AtlasError::InvalidTransition { from, to } => {
                format!("Invalid status transition: {from} -> {to}")
            }
            AtlasError::NoTasksFound { workspace } => match workspace {
                Some(ws) => format!("No matching tasks in workspace '{ws}'"),
                None => "No matching tasks found".into(),
            },
            AtlasError::WorkspaceHasRunningTasks { name } => {
                format!("Workspace '{name}' still has non-terminal tasks")
            }
            AtlasError::InvalidArgument { message } => message.clone(),
            AtlasError::InvalidOutputFormat { value } => {
                format!("Invalid output format '{value}'")
            }
            AtlasError::InvalidToolName { value } => format!("Invalid tool name '{value}'"),
            AtlasError::EmptyValue { field } => format!("{field} must not be empty"),
            AtlasError::InteractiveRequired { message } => message.clone(),
            AtlasError::CommandFailed {
                command,
                exit_code,
                stderr,
            } => {
                let mut msg = match exit_code {
                    Some(code) => format!("Command '{command}' failed (exit {code})"),
                    None => format!("Command '{command}' failed"),
                };
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    msg.push_str(": ");
                    msg.push_str(stderr);
                }
                msg
            }
            AtlasError::ValidationFailed { stage } => format!("Validation failed at {stage}"),
            AtlasError::WatchIntervalTooShort { min_secs } => {
                format!("Watch interval must be at least {min_secs}s")
            }
            AtlasError::WatchModeJsonUnsupported => {
                "--watch is not supported with --output json".into()
            }
            AtlasError::JsonErrorOutput { .. } => String::new(),
            AtlasError::Io { context, source } => format!("{context}: {source}"),
            AtlasError::UnknownTool { name } => format!("Unknown tool '{name}'"),
        }
    }
}

impl std::fmt::Display for AtlasError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The sentinel prints nothing; the JSON document already went out.
        if matches!(self, AtlasError::JsonErrorOutput { .. }) {
            return Ok(());
        }
        let msg = self.plain_message();
        write!(f, "{}", cformat!("{ERROR_EMOJI} <red>{msg}</>"))?;
        if let Some(hint) = self.hint() {
            write!(f, "\n\n{}", cformat!("{HINT_EMOJI} <dim>{hint}</>"))?;
        }
        Ok(())
    }
}

impl std::error::Error for AtlasError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AtlasError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Attach filesystem context to an io::Error in one call.
pub trait IoResultExt<T> {
    fn io_context(self, context: impl Into<String>) -> Result<T, AtlasError>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn io_context(self, context: impl Into<String>) -> Result<T, AtlasError> {
        self.map_err(|source| AtlasError::Io {
            context: context.into(),
            source,
        })
    }
}

/// Resolve the process exit code for an error that reached `main`.
///
/// Downcasts through `anyhow::Error` to find an [`AtlasError`]; anything
/// else (including clap parse errors, which clap exits for itself) is 1.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<AtlasError>() {
        Some(e) => e.exit_code(),
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_errors_exit_2() {
        for err in [
            AtlasError::InvalidArgument {
                message: "bad".into(),
            },
            AtlasError::InvalidOutputFormat {
                value: "yaml".into(),
            },
            AtlasError::InvalidToolName {
                value: "frobnicate".into(),
            },
            AtlasError::InteractiveRequired {
                message: "pick one".into(),
            },
        ] {
            assert_eq!(err.exit_code(), 2, "kind {}", err.kind());
        }
    }

    #[test]
    fn test_other_errors_exit_1() {
        let err = AtlasError::WorkspaceNotFound { name: "ws".into() };
        assert_eq!(err.exit_code(), 1);
        let err = AtlasError::ValidationFailed {
            stage: "lint".into(),
        };
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_json_sentinel_preserves_code() {
        let err = AtlasError::JsonErrorOutput { code: 2 };
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().is_empty());
    }

    #[test]
    fn test_json_document_shape() {
        let err = AtlasError::TaskNotFound {
            workspace: "auth".into(),
            task_id: "t-42".into(),
        };
        let doc = err.to_json();
        assert_eq!(doc["error"]["kind"], "task_not_found");
        assert!(
            doc["error"]["message"]
                .as_str()
                .unwrap()
                .contains("t-42")
        );
    }

    #[test]
    fn test_exit_code_through_anyhow() {
        let err = anyhow::Error::from(AtlasError::InteractiveRequired {
            message: "multiple tasks awaiting approval".into(),
        });
        assert_eq!(exit_code(&err), 2);
        let err = anyhow::anyhow!("opaque");
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(
            AtlasError::WatchModeJsonUnsupported.kind(),
            "watch_mode_json_unsupported"
        );
        assert_eq!(
            AtlasError::EmptyValue {
                field: "feedback".into()
            }
            .kind(),
            "empty_value"
        );
    }
}
