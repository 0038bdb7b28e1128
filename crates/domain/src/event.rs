//! The run event record — the unit of the WAL and of the streaming API.
//!
//! An event is `{type, timestamp, run_id, turn_id?, step_id?, payload}`.
//! The `type` vocabulary is closed; anything a run does that an observer
//! may care about is one of these.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventKind
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Closed event vocabulary. Wire form is the snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    PromptCompiled,
    LlmRequestStarted,
    LlmResponseDelta,
    LlmResponseCompleted,
    ToolCallRequested,
    ToolCallStarted,
    ToolCallFinished,
    ApprovalRequested,
    ApprovalDecided,
    HumanRequest,
    HumanResponse,
    PlanUpdated,
    SkillInjected,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

impl EventKind {
    /// Terminal events end the run; exactly one is emitted per run and
    /// nothing may follow it.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::RunCompleted | Self::RunFailed | Self::RunCancelled)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One record in the WAL / one item in the run's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn now(kind: EventKind, run_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            run_id: run_id.into(),
            turn_id: None,
            step_id: None,
            payload,
        }
    }

    pub fn with_turn(mut self, turn_id: impl Into<String>) -> Self {
        self.turn_id = Some(turn_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
