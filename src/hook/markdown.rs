//! Human-readable `HOOK.md` mirror, a pure function of the hook record.

use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::model::Hook;

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Render the markdown mirror for a hook.
pub fn render_markdown(hook: &Hook) -> String {
    let mut md = String::new();

    let _ = writeln!(md, "# Recovery Hook");
    let _ = writeln!(md);
    let _ = writeln!(md, "- Task: `{}`", hook.task_id);
    let _ = writeln!(md, "- Workspace: `{}`", hook.workspace);
    let _ = writeln!(md, "- State: `{}`", hook.state);
    let _ = writeln!(md, "- Created: {}", ts(&hook.created_at));
    let _ = writeln!(md, "- Updated: {}", ts(&hook.updated_at));

    if let Some(step) = &hook.current_step {
        let _ = writeln!(md);
        let _ = writeln!(md, "## Current Step");
        let _ = writeln!(md);
        let _ = writeln!(
            md,
            "`{}` (index {}, attempt {}/{})",
            step.name, step.index, step.attempt, step.max_attempts
        );
    }

    let _ = writeln!(md);
    let _ = writeln!(md, "## Checkpoints ({})", hook.checkpoints.len());
    if !hook.checkpoints.is_empty() {
        let _ = writeln!(md);
        let _ = writeln!(md, "| Id | When | Trigger | Step | Description |");
        let _ = writeln!(md, "|---|---|---|---|---|");
        for cp in &hook.checkpoints {
            let step = match (&cp.step_name, cp.step_index) {
                (Some(name), Some(index)) => format!("{name} ({index})"),
                (Some(name), None) => name.clone(),
                _ => "-".to_string(),
            };
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} | {} |",
                cp.id,
                ts(&cp.created_at),
                cp.trigger,
                step,
                cp.description
            );
        }
    }

    let _ = writeln!(md);
    let _ = writeln!(md, "## Validation Receipts ({})", hook.receipts.len());
    if !hook.receipts.is_empty() {
        let _ = writeln!(md);
        let _ = writeln!(md, "| Id | Step | Command | Exit | Duration | Signed |");
        let _ = writeln!(md, "|---|---|---|---|---|---|");
        for r in &hook.receipts {
            let _ = writeln!(
                md,
                "| {} | {} | `{}` | {} | {}ms | {} |",
                r.id,
                r.step_name,
                r.command,
                r.exit_code,
                r.duration_ms,
                if r.signature.is_some() { "yes" } else { "no" }
            );
        }
    }

    let _ = writeln!(md);
    let _ = writeln!(md, "## Events ({})", hook.events.len());
    if !hook.events.is_empty() {
        let _ = writeln!(md);
        for event in &hook.events {
            let _ = writeln!(
                md,
                "- {}: {} -> {} ({})",
                ts(&event.at),
                event.from_state,
                event.to_state,
                event.trigger
            );
        }
    }

    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckpointTrigger, HookState, ValidationReceipt};
    use chrono::TimeZone;

    fn fixed_hook() -> Hook {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let mut hook = Hook::new("t-20260314092653-00aa", "auth");
        hook.created_at = t0;
        hook.transition(HookState::StepRunning, "engine begins step", None)
            .unwrap();
        hook.add_checkpoint(CheckpointTrigger::StepComplete, None, Some(("implement", 0)));
        hook.add_receipt(ValidationReceipt {
            id: String::new(),
            step_name: "validate".into(),
            command: "cargo test".into(),
            exit_code: 0,
            duration_ms: 2100,
            key_fingerprint: "0011223344556677".into(),
            signature: Some("aa".repeat(32)),
        });
        // Pin the volatile timestamps so the rendering is deterministic.
        hook.updated_at = t0;
        for event in &mut hook.events {
            event.at = t0;
        }
        for cp in &mut hook.checkpoints {
            cp.created_at = t0;
        }
        hook
    }

    #[test]
    fn test_markdown_is_pure_function_of_hook() {
        let hook = fixed_hook();
        assert_eq!(render_markdown(&hook), render_markdown(&hook));
    }

    #[test]
    fn test_markdown_rendering() {
        let hook = fixed_hook();
        insta::assert_snapshot!(render_markdown(&hook), @r"
        # Recovery Hook

        - Task: `t-20260314092653-00aa`
        - Workspace: `auth`
        - State: `step_running`
        - Created: 2026-03-14T09:26:53Z
        - Updated: 2026-03-14T09:26:53Z

        ## Checkpoints (1)

        | Id | When | Trigger | Step | Description |
        |---|---|---|---|---|
        | cp-1 | 2026-03-14T09:26:53Z | step_complete | implement (0) | step completed |

        ## Validation Receipts (1)

        | Id | Step | Command | Exit | Duration | Signed |
        |---|---|---|---|---|---|
        | r-1 | validate | `cargo test` | 0 | 2100ms | yes |

        ## Events (1)

        - 2026-03-14T09:26:53Z: initializing -> step_running (engine begins step)
        ");
    }

    #[test]
    fn test_empty_sections_render_counts_only() {
        let mut hook = Hook::new("t-1", "auth");
        hook.current_step = None;
        let md = render_markdown(&hook);
        assert!(md.contains("## Checkpoints (0)"));
        assert!(md.contains("## Validation Receipts (0)"));
        assert!(md.contains("## Events (0)"));
        assert!(!md.contains("| Id |"));
    }
}
