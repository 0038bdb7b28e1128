//! Resume and fork: rebuilding a run from its WAL.
//!
//! `summary` synthesizes a `[Resume Summary]` user message from the
//! prior terminal payload and continues fresh. `replay` rebuilds the
//! conversation from `llm_response_completed` and `tool_call_finished`
//! records and primes the approvals cache from prior
//! `approved_for_session` decisions (single-use and denied decisions
//! are not restored).

use std::path::Path;

use serde_json::Value;
use sr_domain::tool::{Message, ToolCall};
use sr_domain::{Error, EventKind, Result};
use sr_wal::{read_prefix, ReadOptions, WalLocator};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ResumeState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default, Debug)]
pub struct ResumeState {
    /// Conversation rebuilt from the WAL (replay only).
    pub history: Vec<Message>,
    /// Approval keys to prime as session grants (replay only).
    pub primed_approvals: Vec<String>,
    /// Synthesized summary user message (summary only).
    pub summary_message: Option<String>,
    /// The original task found in `run_started`, if recorded.
    pub prior_task: Option<String>,
    /// Whether the source WAL already holds a terminal event. A run
    /// may only continue appending to its own WAL when this is false
    /// (a forked prefix); otherwise it must write a fresh WAL.
    pub has_terminal: bool,
}

/// Rebuild the in-memory view of a prior run's WAL for `replay`.
pub fn replay_from_wal(runtime_dir: &Path, run_id: &str) -> Result<ResumeState> {
    let events = read_prefix(runtime_dir, run_id, ReadOptions::default())?;
    let mut state = ResumeState::default();
    state.has_terminal = events.iter().any(|event| event.kind.is_terminal());

    for event in &events {
        match event.kind {
            EventKind::RunStarted => {
                if let Some(task) = event.payload.get("task").and_then(Value::as_str) {
                    state.prior_task = Some(task.to_string());
                }
            }
            EventKind::LlmResponseCompleted => {
                let text = event.payload.get("text").and_then(Value::as_str).unwrap_or_default();
                let tool_calls: Vec<ToolCall> = event
                    .payload
                    .get("tool_calls")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_default();
                if tool_calls.is_empty() {
                    state.history.push(Message::assistant(text));
                } else {
                    state.history.push(Message::assistant_with_tool_calls(text, &tool_calls));
                }
            }
            EventKind::ToolCallFinished => {
                let call_id =
                    event.payload.get("call_id").and_then(Value::as_str).unwrap_or_default();
                let content = tool_message_content(&event.payload);
                state.history.push(Message::tool_result(call_id, content));
            }
            EventKind::ApprovalDecided => {
                let decision = event.payload.get("decision").and_then(Value::as_str);
                if decision == Some("approved_for_session") {
                    if let Some(key) = event.payload.get("approval_key").and_then(Value::as_str) {
                        if !state.primed_approvals.iter().any(|k| k == key) {
                            state.primed_approvals.push(key.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    tracing::info!(
        run_id,
        messages = state.history.len(),
        primed = state.primed_approvals.len(),
        "replayed WAL"
    );
    Ok(state)
}

fn tool_message_content(payload: &Value) -> String {
    let result = &payload["result"];
    let ok = result.get("ok").and_then(Value::as_bool).unwrap_or(false);
    if ok {
        result.get("stdout").and_then(Value::as_str).unwrap_or_default().to_string()
    } else {
        format!(
            "error ({}): {}",
            result.get("error_kind").and_then(Value::as_str).unwrap_or("unknown"),
            result.get("stderr").and_then(Value::as_str).unwrap_or("tool failed"),
        )
    }
}

/// Build the `[Resume Summary]` user message for `summary` resume.
pub fn summary_from_wal(runtime_dir: &Path, run_id: &str) -> Result<ResumeState> {
    let events = read_prefix(runtime_dir, run_id, ReadOptions::default())?;
    let terminal = events.iter().rev().find(|event| event.kind.is_terminal());

    let mut summary = String::from("[Resume Summary]\n");
    match terminal {
        Some(event) => {
            summary.push_str(&format!("Previous run {run_id} ended with {:?}.\n", event.kind));
            if let Some(output) = event.payload.get("final_output").and_then(Value::as_str) {
                summary.push_str("Final output:\n");
                summary.push_str(output);
                summary.push('\n');
            }
            if let Some(message) = event.payload.get("message").and_then(Value::as_str) {
                summary.push_str(&format!("Failure: {message}\n"));
            }
        }
        None => {
            summary.push_str(&format!(
                "Previous run {run_id} was interrupted before completing ({} events recorded).\n",
                events.len()
            ));
        }
    }

    let mut state = ResumeState::default();
    state.has_terminal = terminal.is_some();
    for event in &events {
        if event.kind == EventKind::RunStarted {
            if let Some(task) = event.payload.get("task").and_then(Value::as_str) {
                state.prior_task = Some(task.to_string());
            }
        }
    }
    state.summary_message = Some(summary);
    Ok(state)
}

/// Fork a run: copy the WAL prefix under a new id (see `sr_wal::fork`).
/// The forked run can then be resumed with either strategy.
pub fn fork_run(
    runtime_dir: &Path,
    src_run_id: &str,
    fork_point_index: u64,
    new_run_id: &str,
) -> Result<WalLocator> {
    if new_run_id.is_empty() {
        return Err(Error::Validation("fork target run id must not be empty".into()));
    }
    sr_wal::fork(runtime_dir, src_run_id, fork_point_index, new_run_id)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
