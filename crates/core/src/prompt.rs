//! Prompt compilation: fixed assembly order, budgeted skill injection,
//! and the sliding history window.
//!
//! Order: system template (developer policy merged in, optional skills
//! index appended); injected skill bodies in first-appearance order of
//! their mentions; trimmed history; current user task.

use serde_json::Value;
use sr_domain::config::{HistoryConfig, PromptConfig, SkillsConfig};
use sr_domain::tool::{Message, Role};
use sr_skills::{extract_mentions, SkillRef, SkillsManager};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CompiledPrompt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CompiledPrompt {
    pub messages: Vec<Message>,
    /// Skills whose bodies made it into this prompt, injection order.
    pub injected: Vec<SkillRef>,
    pub injected_bytes: usize,
    /// True when the injection budget forced a truncation or skip.
    pub injection_truncated: bool,
    /// Mentions that resolved but whose body failed to load.
    pub injection_errors: Vec<String>,
    pub history_kept: usize,
    pub history_dropped: usize,
}

impl CompiledPrompt {
    /// Payload for the `prompt_compiled` event: counts, never content.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "messages": self.messages.len(),
            "injected_skills": self.injected.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            "injected_bytes": self.injected_bytes,
            "injection_truncated": self.injection_truncated,
            "injection_errors": self.injection_errors,
            "history_kept": self.history_kept,
            "history_dropped": self.history_dropped,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compile
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn compile(
    prompt_config: &PromptConfig,
    history_config: &HistoryConfig,
    skills_config: &SkillsConfig,
    skills: &SkillsManager,
    history: &[Message],
    task: &str,
) -> CompiledPrompt {
    // ── System message ────────────────────────────────────────────
    let mut system = prompt_config.system_template.clone();
    if let Some(policy) = &prompt_config.developer_policy {
        system.push_str("\n\n");
        system.push_str(policy);
    }
    if prompt_config.include_skills_index {
        if let Ok(all) = skills.list() {
            if !all.is_empty() {
                system.push_str("\n\nAvailable skills (mention as $[namespace].name to load):\n");
                for meta in &all {
                    system.push_str(&format!(
                        "- $[{}].{} — {}\n",
                        meta.space_key(),
                        meta.name,
                        meta.description
                    ));
                }
            }
        }
    }

    // ── Skill injection (first-appearance, first-wins, budgeted) ──
    let mut injected = Vec::new();
    let mut injection_errors = Vec::new();
    let mut injection_messages = Vec::new();
    let mut injected_bytes = 0usize;
    let mut injection_truncated = false;
    let budget = skills_config.injection.max_bytes;

    for mention in extract_mentions(task) {
        if injected.contains(&mention) {
            continue; // first-wins dedupe
        }
        if !skills.has_space(&mention.space_key()) {
            // Free-text extraction is lenient: unknown namespaces are
            // simply not injections.
            continue;
        }
        let body = match skills.load_body(&mention) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(skill = %mention, error = %e, "skill body load failed, injection skipped");
                injection_errors.push(format!("{mention}: {e}"));
                continue;
            }
        };

        let remaining = budget.saturating_sub(injected_bytes);
        if remaining == 0 {
            injection_truncated = true;
            break;
        }
        let mut text = body;
        if text.len() > remaining {
            injection_truncated = true;
            let mut cut = remaining;
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        injected_bytes += text.len();
        injection_messages.push(Message::system(format!("[Skill {mention}]\n{text}")));
        injected.push(mention);
    }

    // ── History window ────────────────────────────────────────────
    let (kept, dropped) = trim_history(history, history_config);

    let mut messages = Vec::with_capacity(2 + injection_messages.len() + kept.len());
    messages.push(Message::system(system));
    messages.extend(injection_messages);
    messages.extend(kept.iter().map(|m| (*m).clone()));
    messages.push(Message::user(task));

    CompiledPrompt {
        messages,
        injected,
        injected_bytes,
        injection_truncated,
        injection_errors,
        history_kept: kept.len(),
        history_dropped: dropped,
    }
}

/// Keep the newest messages within both bounds (whichever fires
/// first). The most recent user message and the trailing tool/assistant
/// messages of the current turn survive regardless.
fn trim_history<'a>(
    history: &'a [Message],
    config: &HistoryConfig,
) -> (Vec<&'a Message>, usize) {
    // Index of the last user message; everything from there on is the
    // current turn's tail and is always kept.
    let pinned_from = history
        .iter()
        .rposition(|m| m.role == Role::User)
        .unwrap_or(history.len());

    let mut kept_rev: Vec<&Message> = Vec::new();
    let mut chars = 0usize;
    for (index, message) in history.iter().enumerate().rev() {
        let pinned = index >= pinned_from;
        let message_chars = message.content.char_len();
        if !pinned {
            if kept_rev.len() + 1 > config.max_messages {
                break;
            }
            if chars + message_chars > config.max_chars {
                break;
            }
        }
        chars += message_chars;
        kept_rev.push(message);
    }
    kept_rev.reverse();
    let dropped = history.len() - kept_rev.len();
    (kept_rev, dropped)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use sr_domain::config::RefreshPolicy;
    use sr_skills::MemorySource;
    use std::sync::Arc;

    fn skills_with(space: &str, entries: &[(&str, &str)]) -> SkillsManager {
        let mut source = MemorySource::new();
        for (name, body) in entries {
            source = source.insert(name, "test skill", body);
        }
        let mut manager = SkillsManager::empty(RefreshPolicy::Manual);
        manager.add_source(space, Arc::new(source));
        manager
    }

    fn compile_simple(skills: &SkillsManager, task: &str, max_bytes: usize) -> CompiledPrompt {
        let mut skills_config = SkillsConfig::default();
        skills_config.injection.max_bytes = max_bytes;
        compile(
            &PromptConfig::default(),
            &HistoryConfig::default(),
            &skills_config,
            skills,
            &[],
            task,
        )
    }

    fn text_of(message: &Message) -> &str {
        message.content.text().unwrap_or_default()
    }

    #[test]
    fn assembly_order_system_skills_history_task() {
        let skills = skills_with("team", &[("lint", "lint body")]);
        let history = vec![Message::user("earlier"), Message::assistant("earlier answer")];
        let compiled = compile(
            &PromptConfig::default(),
            &HistoryConfig::default(),
            &SkillsConfig::default(),
            &skills,
            &history,
            "run $[team].lint please",
        );

        assert_eq!(compiled.messages[0].role, Role::System);
        assert!(text_of(&compiled.messages[1]).starts_with("[Skill $[team].lint]"));
        assert_eq!(text_of(&compiled.messages[2]), "earlier");
        assert_eq!(text_of(&compiled.messages[3]), "earlier answer");
        assert_eq!(text_of(&compiled.messages[4]), "run $[team].lint please");
        assert_eq!(compiled.injected.len(), 1);
    }

    #[test]
    fn skills_index_enumerated_in_system() {
        let skills = skills_with("team", &[("lint", "b")]);
        let compiled = compile_simple(&skills, "no mentions", 1000);
        let system = text_of(&compiled.messages[0]);
        assert!(system.contains("$[team].lint"));
        assert!(compiled.injected.is_empty());
    }

    #[test]
    fn duplicate_mentions_inject_once() {
        let skills = skills_with("team", &[("lint", "lint body")]);
        let compiled = compile_simple(&skills, "$[team].lint then $[team].lint again", 1000);
        assert_eq!(compiled.injected.len(), 1);
    }

    #[test]
    fn injection_budget_truncates_not_the_task() {
        let skills = skills_with("team", &[("big", "0123456789abcdef")]);
        // Budget of 10 bytes: the body is truncated to fit.
        let compiled = compile_simple(&skills, "$[team].big", 10);
        assert!(compiled.injection_truncated);
        assert_eq!(compiled.injected_bytes, 10);
        // Task message is intact at the end.
        assert_eq!(text_of(compiled.messages.last().unwrap()), "$[team].big");
    }

    #[test]
    fn second_skill_skipped_when_budget_spent() {
        let skills = skills_with("team", &[("aa-first", "aaaaaaaaaa"), ("bb-second", "bbbb")]);
        let compiled = compile_simple(&skills, "$[team].aa-first and $[team].bb-second", 10);
        assert_eq!(compiled.injected.len(), 1);
        assert!(compiled.injection_truncated);
    }

    #[test]
    fn unknown_namespace_mention_ignored() {
        let skills = skills_with("team", &[("lint", "b")]);
        let compiled = compile_simple(&skills, "try $[ghost].lint", 1000);
        assert!(compiled.injected.is_empty());
        assert!(compiled.injection_errors.is_empty());
    }

    #[test]
    fn missing_skill_in_known_namespace_records_error() {
        let skills = skills_with("team", &[("lint", "b")]);
        let compiled = compile_simple(&skills, "try $[team].missing", 1000);
        assert!(compiled.injected.is_empty());
        assert_eq!(compiled.injection_errors.len(), 1);
    }

    #[test]
    fn history_window_by_message_count() {
        let skills = skills_with("team", &[]);
        let mut history = Vec::new();
        for i in 0..10 {
            history.push(Message::user(format!("u{i}")));
            history.push(Message::assistant(format!("a{i}")));
        }
        let config = HistoryConfig { max_messages: 4, max_chars: 1_000_000 };
        let compiled = compile(
            &PromptConfig::default(),
            &config,
            &SkillsConfig::default(),
            &skills,
            &history,
            "now",
        );
        // Last user message is pinned; plus up to 4 unpinned ones.
        assert!(compiled.history_kept <= 6);
        assert!(compiled.history_dropped >= 14);
        // Newest survive.
        let texts: Vec<_> = compiled.messages.iter().map(text_of).collect();
        assert!(texts.contains(&"a9"));
        assert!(texts.contains(&"u9"));
        assert!(!texts.contains(&"u0"));
    }

    #[test]
    fn history_window_by_chars() {
        let skills = skills_with("team", &[]);
        let history = vec![
            Message::user("x".repeat(500)),
            Message::assistant("y".repeat(500)),
            Message::user("recent question"),
        ];
        let config = HistoryConfig { max_messages: 100, max_chars: 100 };
        let compiled = compile(
            &PromptConfig::default(),
            &config,
            &SkillsConfig::default(),
            &skills,
            &history,
            "now",
        );
        // The pinned last user message survives even over budget.
        let texts: Vec<_> = compiled.messages.iter().map(text_of).collect();
        assert!(texts.contains(&"recent question"));
        assert_eq!(compiled.history_dropped, 2);
    }

    #[test]
    fn current_turn_tool_messages_pinned() {
        let skills = skills_with("team", &[]);
        let history = vec![
            Message::user("old".repeat(100)),
            Message::user("do the thing"),
            Message::assistant_with_tool_calls("", &[]),
            Message::tool_result("c1", "tool output ".repeat(50)),
        ];
        let config = HistoryConfig { max_messages: 2, max_chars: 50 };
        let compiled = compile(
            &PromptConfig::default(),
            &config,
            &SkillsConfig::default(),
            &skills,
            &history,
            "continue",
        );
        // Everything from the last user message on is kept.
        assert!(compiled.history_kept >= 3);
        assert_eq!(compiled.history_dropped, 1);
    }

    #[test]
    fn summary_payload_shape() {
        let skills = skills_with("team", &[("lint", "body")]);
        let compiled = compile_simple(&skills, "$[team].lint", 1000);
        let summary = compiled.summary();
        assert_eq!(summary["injected_skills"], serde_json::json!(["$[team].lint"]));
        assert_eq!(summary["history_dropped"], 0);
        assert!(summary["injected_bytes"].as_u64().unwrap() > 0);
    }
}
