//! Loop controller: step/wall-time budgets and the context-recovery
//! state machine.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use sr_domain::config::{ContextRecoveryConfig, RecoveryFallback, RecoveryMode, RunBudgetConfig};
use sr_domain::tool::{Message, Role};
use sr_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Notices
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Carried in the terminal event's metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub kind: String,
    pub count: u32,
    pub message: String,
    pub suggestion: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Controller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What to do when the backend reports a context-window overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    FailFast,
    Compact,
    Ask,
}

pub struct LoopController {
    max_steps: u32,
    steps_used: u32,
    started: Instant,
    max_wall_time: Duration,
    budget_config: RunBudgetConfig,
    recovery: ContextRecoveryConfig,
    compactions_done: u32,
    notices: Vec<Notice>,
}

impl LoopController {
    pub fn new(budget: RunBudgetConfig, recovery: ContextRecoveryConfig) -> Self {
        Self {
            max_steps: budget.max_steps,
            steps_used: 0,
            started: Instant::now(),
            max_wall_time: Duration::from_secs(budget.max_wall_time_sec),
            budget_config: budget,
            recovery,
            compactions_done: 0,
            notices: Vec::new(),
        }
    }

    /// Charge one step (an LLM request or a tool call). Fails with
    /// `budget` when either bound is exhausted.
    pub fn begin_step(&mut self) -> Result<u32> {
        if self.started.elapsed() >= self.max_wall_time {
            return Err(Error::Budget(format!(
                "wall time budget of {}s exhausted",
                self.max_wall_time.as_secs()
            )));
        }
        if self.steps_used >= self.max_steps {
            return Err(Error::Budget(format!("step budget of {} exhausted", self.max_steps)));
        }
        self.steps_used += 1;
        Ok(self.steps_used)
    }

    pub fn steps_used(&self) -> u32 {
        self.steps_used
    }

    /// "Increase budget" on a recovery prompt.
    pub fn extend_budgets(&mut self) {
        self.max_steps += self.budget_config.step_increment;
        self.max_wall_time += Duration::from_secs(self.budget_config.wall_time_increment_sec);
        tracing::info!(
            max_steps = self.max_steps,
            max_wall_time_sec = self.max_wall_time.as_secs(),
            "budgets extended"
        );
    }

    /// Dispatch a context-window overflow per the configured mode.
    /// Compaction attempts are bounded; past the bound the overflow is
    /// terminal regardless of mode.
    pub fn on_context_overflow(&mut self, human_available: bool) -> RecoveryAction {
        let exhausted = self.compactions_done >= self.recovery.max_compactions_per_run;
        match self.recovery.mode {
            RecoveryMode::FailFast => RecoveryAction::FailFast,
            RecoveryMode::CompactFirst => {
                if exhausted {
                    RecoveryAction::FailFast
                } else {
                    RecoveryAction::Compact
                }
            }
            RecoveryMode::AskFirst => {
                if exhausted {
                    RecoveryAction::FailFast
                } else if human_available {
                    RecoveryAction::Ask
                } else {
                    match self.recovery.ask_first_fallback_mode {
                        RecoveryFallback::FailFast => RecoveryAction::FailFast,
                        RecoveryFallback::CompactFirst => RecoveryAction::Compact,
                    }
                }
            }
        }
    }

    pub fn record_compaction(&mut self) {
        self.compactions_done += 1;
        self.notices.push(Notice {
            kind: "context_compacted".into(),
            count: self.compactions_done,
            message: "conversation history was summarized to fit the model context".into(),
            suggestion: "start a new run for unrelated work to keep full context".into(),
        });
    }

    pub fn compactions_done(&self) -> u32 {
        self.compactions_done
    }

    pub fn notices_value(&self) -> Option<Value> {
        if self.notices.is_empty() {
            None
        } else {
            serde_json::to_value(&self.notices).ok()
        }
    }

    // ── Compaction helpers ─────────────────────────────────────────

    /// Flatten the oldest history into the summarization prompt,
    /// bounded by `compaction_history_max_chars`. Returns `None` when
    /// nothing would be compacted.
    pub fn compaction_prompt(&self, history: &[Message]) -> Option<String> {
        let keep = self.recovery.compaction_keep_last_messages.min(history.len());
        let to_compact = &history[..history.len() - keep];
        if to_compact.is_empty() {
            return None;
        }

        let mut conversation = String::new();
        for message in to_compact {
            let label = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let text = message.content.text().unwrap_or_default();
            conversation.push_str(label);
            conversation.push_str(": ");
            conversation.push_str(text);
            conversation.push('\n');
            if conversation.len() >= self.recovery.compaction_history_max_chars {
                let mut cut = self.recovery.compaction_history_max_chars;
                while cut > 0 && !conversation.is_char_boundary(cut) {
                    cut -= 1;
                }
                conversation.truncate(cut);
                break;
            }
        }

        Some(format!(
            "Summarize the following conversation history into a concise summary that preserves:\n\
             1. The current goal being worked on\n\
             2. Key decisions made\n\
             3. Open questions or threads\n\
             4. Tool state (running sessions, pending work)\n\n\
             Be concise but keep all actionable context.\n\n\
             CONVERSATION:\n{conversation}"
        ))
    }

    /// Rebuild history after a successful compaction: summary marker
    /// first, then the last `compaction_keep_last_messages` originals.
    pub fn apply_compaction(&self, history: &[Message], summary: &str) -> Vec<Message> {
        let keep = self.recovery.compaction_keep_last_messages.min(history.len());
        let mut rebuilt = Vec::with_capacity(keep + 1);
        rebuilt.push(Message::user(format!("[Context Summary]\n{summary}")));
        rebuilt.extend(history[history.len() - keep..].iter().cloned());
        rebuilt
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(max_steps: u32) -> RunBudgetConfig {
        RunBudgetConfig {
            max_steps,
            max_wall_time_sec: 3600,
            step_increment: 4,
            wall_time_increment_sec: 60,
        }
    }

    fn recovery(mode: RecoveryMode) -> ContextRecoveryConfig {
        ContextRecoveryConfig {
            mode,
            max_compactions_per_run: 2,
            compaction_history_max_chars: 200,
            compaction_keep_last_messages: 2,
            ask_first_fallback_mode: RecoveryFallback::CompactFirst,
        }
    }

    #[test]
    fn step_budget_exhausts() {
        let mut controller = LoopController::new(budget(2), recovery(RecoveryMode::FailFast));
        assert_eq!(controller.begin_step().unwrap(), 1);
        assert_eq!(controller.begin_step().unwrap(), 2);
        let err = controller.begin_step().unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::Budget);
    }

    #[test]
    fn extend_budgets_allows_more_steps() {
        let mut controller = LoopController::new(budget(1), recovery(RecoveryMode::FailFast));
        controller.begin_step().unwrap();
        assert!(controller.begin_step().is_err());
        controller.extend_budgets();
        assert_eq!(controller.begin_step().unwrap(), 2);
    }

    #[test]
    fn wall_time_budget_exhausts() {
        let config = RunBudgetConfig {
            max_steps: 100,
            max_wall_time_sec: 0,
            step_increment: 1,
            wall_time_increment_sec: 1,
        };
        let mut controller = LoopController::new(config, recovery(RecoveryMode::FailFast));
        let err = controller.begin_step().unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::Budget);
    }

    #[test]
    fn fail_fast_mode() {
        let mut controller = LoopController::new(budget(10), recovery(RecoveryMode::FailFast));
        assert_eq!(controller.on_context_overflow(true), RecoveryAction::FailFast);
    }

    #[test]
    fn compact_first_until_exhausted() {
        let mut controller = LoopController::new(budget(10), recovery(RecoveryMode::CompactFirst));
        assert_eq!(controller.on_context_overflow(false), RecoveryAction::Compact);
        controller.record_compaction();
        assert_eq!(controller.on_context_overflow(false), RecoveryAction::Compact);
        controller.record_compaction();
        // max_compactions_per_run = 2: the third overflow is terminal.
        assert_eq!(controller.on_context_overflow(false), RecoveryAction::FailFast);
    }

    #[test]
    fn ask_first_uses_human_when_available() {
        let mut controller = LoopController::new(budget(10), recovery(RecoveryMode::AskFirst));
        assert_eq!(controller.on_context_overflow(true), RecoveryAction::Ask);
        // Fallback applies without a provider.
        assert_eq!(controller.on_context_overflow(false), RecoveryAction::Compact);
    }

    #[test]
    fn ask_first_fallback_fail_fast() {
        let mut config = recovery(RecoveryMode::AskFirst);
        config.ask_first_fallback_mode = RecoveryFallback::FailFast;
        let mut controller = LoopController::new(budget(10), config);
        assert_eq!(controller.on_context_overflow(false), RecoveryAction::FailFast);
    }

    #[test]
    fn compaction_notice_recorded() {
        let mut controller = LoopController::new(budget(10), recovery(RecoveryMode::CompactFirst));
        controller.record_compaction();
        let notices = controller.notices_value().unwrap();
        assert_eq!(notices[0]["kind"], "context_compacted");
        assert_eq!(notices[0]["count"], 1);
    }

    #[test]
    fn no_notices_when_nothing_happened() {
        let controller = LoopController::new(budget(10), recovery(RecoveryMode::CompactFirst));
        assert!(controller.notices_value().is_none());
    }

    #[test]
    fn compaction_prompt_respects_keep_window() {
        let controller = LoopController::new(budget(10), recovery(RecoveryMode::CompactFirst));
        let history = vec![
            Message::user("oldest question"),
            Message::assistant("oldest answer"),
            Message::user("recent question"),
            Message::assistant("recent answer"),
        ];
        let prompt = controller.compaction_prompt(&history).unwrap();
        assert!(prompt.contains("oldest question"));
        // keep_last_messages = 2: the recent pair is not summarized.
        assert!(!prompt.contains("recent answer"));
    }

    #[test]
    fn compaction_prompt_none_when_everything_kept() {
        let controller = LoopController::new(budget(10), recovery(RecoveryMode::CompactFirst));
        let history = vec![Message::user("only"), Message::assistant("two")];
        assert!(controller.compaction_prompt(&history).is_none());
    }

    #[test]
    fn compaction_prompt_bounded_by_chars() {
        let controller = LoopController::new(budget(10), recovery(RecoveryMode::CompactFirst));
        let mut history = Vec::new();
        for i in 0..50 {
            history.push(Message::user(format!("message {i} {}", "x".repeat(50))));
        }
        let prompt = controller.compaction_prompt(&history).unwrap();
        // Conversation body capped at compaction_history_max_chars (200).
        assert!(prompt.len() < 600);
    }

    #[test]
    fn apply_compaction_rebuilds_history() {
        let controller = LoopController::new(budget(10), recovery(RecoveryMode::CompactFirst));
        let history = vec![
            Message::user("old"),
            Message::assistant("old answer"),
            Message::user("new"),
            Message::assistant("new answer"),
        ];
        let rebuilt = controller.apply_compaction(&history, "the user wants X");
        assert_eq!(rebuilt.len(), 3);
        assert!(rebuilt[0].content.text().unwrap().starts_with("[Context Summary]"));
        assert_eq!(rebuilt[1].content.text().unwrap(), "new");
        assert_eq!(rebuilt[2].content.text().unwrap(), "new answer");
    }
}
