//! Hook records: the per-task recovery journal.
//!
//! A hook is write-mostly during normal operation and read back as the
//! resume oracle after a crash. Checkpoint and receipt lists are bounded;
//! oldest entries are evicted FIFO so the newest entry is always last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AtlasError;

use super::SCHEMA_VERSION;

pub const MAX_CHECKPOINTS: usize = 50;
pub const MAX_RECEIPTS: usize = 50;
pub const MAX_EVENTS: usize = 100;

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
pub enum HookState {
    Initializing,
    StepRunning,
    StepWaiting,
    Completed,
    Failed,
    Abandoned,
}

impl HookState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HookState::Completed | HookState::Failed | HookState::Abandoned
        )
    }

    /// Whether `self -> to` is a permitted hook transition.
    pub fn can_transition_to(self, to: HookState) -> bool {
        use HookState::*;
        match (self, to) {
            (Initializing, StepRunning) => true,
            (StepRunning, StepWaiting) => true,
            (StepWaiting, StepRunning) => true,
            (StepRunning, Completed) => true,
            (StepRunning | StepWaiting, Failed) => true,
            (from, Abandoned) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Context for the step the engine is currently executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentStep {
    pub name: String,
    /// 0-based index into the task's step list.
    pub index: usize,
    pub attempt: u32,
    pub max_attempts: u32,
}

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
pub enum CheckpointTrigger {
    Manual,
    GitCommit,
    GitPush,
    PrCreated,
    Validation,
    StepComplete,
    Interval,
}

impl CheckpointTrigger {
    /// Default description when the caller supplies none.
    pub fn default_description(self) -> &'static str {
        match self {
            CheckpointTrigger::Manual => "manual checkpoint",
            CheckpointTrigger::GitCommit => "commit recorded",
            CheckpointTrigger::GitPush => "branch pushed",
            CheckpointTrigger::PrCreated => "pull request opened",
            CheckpointTrigger::Validation => "validation passed",
            CheckpointTrigger::StepComplete => "step completed",
            CheckpointTrigger::Interval => "interval snapshot",
        }
    }
}

/// A recorded, trigger-tagged moment within a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub trigger: CheckpointTrigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
}

/// A signed record that a validation command ran with a specific outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReceipt {
    pub id: String,
    pub step_name: String,
    pub command: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub key_fingerprint: String,
    /// HMAC-SHA256 over the canonical form, lowercase hex. A receipt with a
    /// missing or invalid signature is untrusted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ValidationReceipt {
    /// Canonical byte form the signature covers. Field order is fixed;
    /// changing it invalidates every existing signature.
    pub fn canonical_form(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.id,
            self.step_name,
            self.command,
            self.exit_code,
            self.duration_ms,
            self.key_fingerprint
        )
    }
}

/// One hook state change, kept as bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    pub at: DateTime<Utc>,
    pub from_state: HookState,
    pub to_state: HookState,
    pub trigger: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// The per-task recovery record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    pub schema_version: u32,
    pub task_id: String,
    pub workspace: String,
    pub state: HookState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<CurrentStep>,
    #[serde(default)]
    pub checkpoints: Vec<StepCheckpoint>,
    #[serde(default)]
    pub receipts: Vec<ValidationReceipt>,
    #[serde(default)]
    pub events: Vec<HookEvent>,
    /// Monotone counters so ids stay unique across FIFO eviction.
    #[serde(default)]
    pub checkpoint_seq: u64,
    #[serde(default)]
    pub receipt_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Hook {
    pub fn new(task_id: &str, workspace: &str) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            task_id: task_id.to_string(),
            workspace: workspace.to_string(),
            state: HookState::Initializing,
            current_step: None,
            checkpoints: Vec::new(),
            receipts: Vec::new(),
            events: Vec::new(),
            checkpoint_seq: 0,
            receipt_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate and record a state change, appending a [`HookEvent`].
    pub fn transition(
        &mut self,
        to: HookState,
        trigger: &str,
        details: Option<String>,
    ) -> Result<(), AtlasError> {
        if !self.state.can_transition_to(to) {
            return Err(AtlasError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        self.events.push(HookEvent {
            at: now,
            from_state: self.state,
            to_state: to,
            trigger: trigger.to_string(),
            details,
        });
        if self.events.len() > MAX_EVENTS {
            let overflow = self.events.len() - MAX_EVENTS;
            self.events.drain(..overflow);
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    /// Append a checkpoint, evicting the oldest past the cap.
    pub fn add_checkpoint(
        &mut self,
        trigger: CheckpointTrigger,
        description: Option<&str>,
        step: Option<(&str, usize)>,
    ) -> &StepCheckpoint {
        self.checkpoint_seq += 1;
        let checkpoint = StepCheckpoint {
            id: format!("cp-{}", self.checkpoint_seq),
            created_at: Utc::now(),
            description: description
                .map(str::to_string)
                .unwrap_or_else(|| trigger.default_description().to_string()),
            trigger,
            step_name: step.map(|(name, _)| name.to_string()),
            step_index: step.map(|(_, index)| index),
        };
        self.checkpoints.push(checkpoint);
        if self.checkpoints.len() > MAX_CHECKPOINTS {
            let overflow = self.checkpoints.len() - MAX_CHECKPOINTS;
            self.checkpoints.drain(..overflow);
        }
        self.updated_at = Utc::now();
        self.checkpoints.last().unwrap()
    }

    /// Append a receipt, evicting the oldest past the cap.
    ///
    /// Assigns the receipt id; the caller signs afterwards (the id is part
    /// of the canonical form).
    pub fn add_receipt(&mut self, mut receipt: ValidationReceipt) -> &mut ValidationReceipt {
        self.receipt_seq += 1;
        receipt.id = format!("r-{}", self.receipt_seq);
        self.receipts.push(receipt);
        if self.receipts.len() > MAX_RECEIPTS {
            let overflow = self.receipts.len() - MAX_RECEIPTS;
            self.receipts.drain(..overflow);
        }
        self.updated_at = Utc::now();
        self.receipts.last_mut().unwrap()
    }

    /// Evict oldest entries past the bounded-list caps.
    pub fn enforce_caps(&mut self) {
        if self.checkpoints.len() > MAX_CHECKPOINTS {
            let overflow = self.checkpoints.len() - MAX_CHECKPOINTS;
            self.checkpoints.drain(..overflow);
        }
        if self.receipts.len() > MAX_RECEIPTS {
            let overflow = self.receipts.len() - MAX_RECEIPTS;
            self.receipts.drain(..overflow);
        }
        if self.events.len() > MAX_EVENTS {
            let overflow = self.events.len() - MAX_EVENTS;
            self.events.drain(..overflow);
        }
    }

    pub fn over_caps(&self) -> bool {
        self.checkpoints.len() > MAX_CHECKPOINTS
            || self.receipts.len() > MAX_RECEIPTS
            || self.events.len() > MAX_EVENTS
    }

    /// Highest step index recorded by any step-scoped checkpoint.
    ///
    /// This is the resume oracle: steps at or below this index already ran
    /// to their checkpointed trigger.
    pub fn last_checkpointed_step(&self) -> Option<usize> {
        self.checkpoints.iter().filter_map(|c| c.step_index).max()
    }
}
