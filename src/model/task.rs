//! Task records: the step list, status machine, and transition journal.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::AtlasError;

use super::SCHEMA_VERSION;

/// Task status.
///
/// The permitted transition pairs form a closed set; see
/// [`TaskStatus::can_transition_to`]. Identity transitions are always
/// permitted so interruptions can be journaled without a status change.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Validating,
    ValidationFailed,
    AwaitingApproval,
    Completed,
    Rejected,
    Abandoned,
    GhFailed,
    CiFailed,
    CiTimeout,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Rejected | TaskStatus::Abandoned
        )
    }

    /// Statuses `resume` accepts. `Running` is included for crash recovery:
    /// a process killed mid-step leaves the persisted status at `running`,
    /// and the hook distinguishes a live run from a dead one.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            TaskStatus::ValidationFailed
                | TaskStatus::GhFailed
                | TaskStatus::CiFailed
                | TaskStatus::CiTimeout
                | TaskStatus::AwaitingApproval
                | TaskStatus::Running
        )
    }

    /// Whether `self -> to` is in the permitted transition set.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if self == to {
            // Identity transitions journal interruptions without moving.
            return true;
        }
        match self {
            Pending => matches!(to, Running),
            Running => matches!(
                to,
                Validating
                    | AwaitingApproval
                    | Completed
                    | ValidationFailed
                    | GhFailed
                    | CiFailed
                    | CiTimeout
                    | Abandoned
            ),
            Validating => matches!(to, Running | ValidationFailed | AwaitingApproval),
            ValidationFailed => matches!(to, Running | Abandoned),
            AwaitingApproval => matches!(to, Completed | Rejected | Running),
            GhFailed | CiFailed | CiTimeout => matches!(to, Running | Abandoned),
            Completed | Rejected | Abandoned => false,
        }
    }
}

/// Step type tag, drawn from the closed executor registry.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepKind {
    AiStep,
    Format,
    Lint,
    Test,
    PreCommit,
    Validate,
    Commit,
    Push,
    Pr,
    AwaitApproval,
    CiWatch,
}

/// One typed unit within a task.
///
/// Steps are fully enumerated at task creation; the list is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    /// Command specification for commandy steps (none for built-ins).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
}

impl Step {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            command: None,
            completed_at: None,
            attempts: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// One entry in the append-only transition journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<IndexMap<String, String>>,
}

/// A named, ordered step list applied at task creation.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTemplate {
    pub name: String,
    pub steps: Vec<(String, StepKind)>,
}

impl TaskTemplate {
    /// The built-in templates. Config may add more under `[templates]`.
    pub fn builtin(name: &str) -> Option<Self> {
        let steps: Vec<(&str, StepKind)> = match name {
            "feature" | "fix" => vec![
                ("implement", StepKind::AiStep),
                ("validate", StepKind::Validate),
                ("commit", StepKind::Commit),
                ("push", StepKind::Push),
                ("pr", StepKind::Pr),
                ("await_approval", StepKind::AwaitApproval),
            ],
            "validate-only" => vec![("validate", StepKind::Validate)],
            _ => return None,
        };
        Some(Self {
            name: name.to_string(),
            steps: steps
                .into_iter()
                .map(|(n, k)| (n.to_string(), k))
                .collect(),
        })
    }
}

/// A single unit of AI-assisted work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub schema_version: u32,
    pub id: String,
    pub workspace: String,
    pub description: String,
    pub template: String,
    pub steps: Vec<Step>,
    /// 0-based; equals `steps.len()` only in a terminal status.
    pub current_step: usize,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub metadata: IndexMap<String, serde_json::Value>,
}

impl Task {
    pub fn new(workspace: &str, description: &str, template: &TaskTemplate) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            id: generate_task_id(now),
            workspace: workspace.to_string(),
            description: description.to_string(),
            template: template.name.clone(),
            steps: template
                .steps
                .iter()
                .map(|(name, kind)| Step::new(name, *kind))
                .collect(),
            current_step: 0,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            transitions: Vec::new(),
            metadata: IndexMap::new(),
        }
    }

    /// Validate and record a status transition.
    ///
    /// Appends to the journal, bumps `updated_at`, and for terminal statuses
    /// advances `current_step` past the end of the step list.
    pub fn transition(&mut self, to: TaskStatus, reason: &str) -> Result<(), AtlasError> {
        self.transition_with_details(to, reason, None)
    }

    pub fn transition_with_details(
        &mut self,
        to: TaskStatus,
        reason: &str,
        details: Option<IndexMap<String, String>>,
    ) -> Result<(), AtlasError> {
        if !self.status.can_transition_to(to) {
            return Err(AtlasError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        self.transitions.push(Transition {
            from_status: self.status,
            to_status: to,
            at: now,
            reason: reason.to_string(),
            details,
        });
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.current_step = self.steps.len();
        }
        Ok(())
    }

    pub fn current_step_ref(&self) -> Option<&Step> {
        self.steps.get(self.current_step)
    }

    /// All steps completed (or the task is parked past its last step).
    pub fn steps_exhausted(&self) -> bool {
        self.current_step >= self.steps.len()
    }
}

fn generate_task_id(now: DateTime<Utc>) -> String {
    let suffix: u16 = rand::random();
    format!("t-{}-{suffix:04x}", now.format("%Y%m%d%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature_task() -> Task {
        let template = TaskTemplate::builtin("feature").unwrap();
        Task::new("auth", "add login flow", &template)
    }

    #[test]
    fn test_new_task_is_pending_at_step_zero() {
        let task = feature_task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.current_step, 0);
        assert_eq!(task.steps.len(), 6);
        assert_eq!(task.schema_version, SCHEMA_VERSION);
        assert!(task.id.starts_with("t-"));
    }

    #[test]
    fn test_permitted_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(AwaitingApproval));
        assert!(Running.can_transition_to(Validating));
        assert!(Validating.can_transition_to(ValidationFailed));
        assert!(ValidationFailed.can_transition_to(Running));
        assert!(AwaitingApproval.can_transition_to(Completed));
        assert!(AwaitingApproval.can_transition_to(Rejected));
        assert!(GhFailed.can_transition_to(Running));
        assert!(CiTimeout.can_transition_to(Abandoned));
    }

    #[test]
    fn test_forbidden_transitions() {
        use TaskStatus::*;
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Rejected.can_transition_to(Running));
        assert!(!Abandoned.can_transition_to(Pending));
        assert!(!Validating.can_transition_to(Completed));
    }

    #[test]
    fn test_identity_transition_is_permitted() {
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn test_transition_journal_links() {
        let mut task = feature_task();
        task.transition(TaskStatus::Running, "engine started").unwrap();
        task.transition(TaskStatus::AwaitingApproval, "parked").unwrap();
        task.transition(TaskStatus::Completed, "User approved").unwrap();

        assert_eq!(task.transitions.len(), 3);
        for pair in task.transitions.windows(2) {
            assert_eq!(pair[0].to_status, pair[1].from_status);
        }
        assert_eq!(task.transitions[0].from_status, TaskStatus::Pending);
        assert_eq!(task.current_step, task.steps.len());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut task = feature_task();
        let err = task.transition(TaskStatus::Completed, "nope").unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.transitions.is_empty());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::AwaitingApproval).unwrap();
        assert_eq!(json, "\"awaiting_approval\"");
        assert_eq!(TaskStatus::CiTimeout.to_string(), "ci_timeout");
    }

    #[test]
    fn test_step_kind_round_trips_through_strings() {
        use std::str::FromStr;
        assert_eq!(StepKind::from_str("ai_step").unwrap(), StepKind::AiStep);
        assert_eq!(StepKind::PreCommit.to_string(), "pre_commit");
    }

    #[test]
    fn test_task_round_trips_through_json() {
        let mut task = feature_task();
        task.transition(TaskStatus::Running, "engine started").unwrap();
        task.metadata
            .insert("pr_url".into(), serde_json::json!("https://example.test/pr/1"));
        let json = serde_json::to_string_pretty(&task).unwrap();
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, task);
    }

    #[test]
    fn test_builtin_templates() {
        assert!(TaskTemplate::builtin("feature").is_some());
        assert!(TaskTemplate::builtin("validate-only").is_some());
        assert!(TaskTemplate::builtin("nonsense").is_none());
    }
}
