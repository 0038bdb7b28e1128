use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

/// Internal tool call format (backend-agnostic).
/// Every backend adapter converts its wire tool calls to/from this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolResult
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Normalized outcome of one tool execution. This is the shape written
/// into `tool_call_finished` payloads; error text travels in `stderr`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub truncated: bool,
    /// Tool-specific structured output (e.g. `data.sandbox` audit info).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub retryable: bool,
}

impl ToolResult {
    /// A successful result with stdout text.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            ok: true,
            exit_code: None,
            stdout: Some(stdout.into()),
            stderr: None,
            duration_ms: 0,
            truncated: false,
            data: None,
            error_kind: None,
            retryable: false,
        }
    }

    /// A failed result carrying an error kind and message.
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            exit_code: None,
            stdout: None,
            stderr: Some(message.into()),
            duration_ms: 0,
            truncated: false,
            data: None,
            error_kind: Some(kind),
            retryable: matches!(kind, ErrorKind::Timeout | ErrorKind::Io),
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The text injected back into the conversation as the tool message.
    pub fn content_for_model(&self) -> String {
        if self.ok {
            self.stdout.clone().unwrap_or_default()
        } else {
            let kind = self.error_kind.unwrap_or(ErrorKind::Unknown);
            let detail = self.stderr.as_deref().unwrap_or("tool failed");
            format!("error ({kind}): {detail}")
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A message in the conversation (backend-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: MessageContent::Text(text.into()) }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: MessageContent::Text(text.into()) }
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Text(text.into()) }
    }
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error: false,
            }]),
        }
    }

    /// Assistant message carrying text plus the tool calls it issued.
    pub fn assistant_with_tool_calls(text: &str, calls: &[ToolCall]) -> Self {
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text { text: text.to_string() });
        }
        for call in calls {
            parts.push(ContentPart::ToolUse {
                id: call.call_id.clone(),
                name: call.tool_name.clone(),
                input: call.arguments.clone(),
            });
        }
        Self { role: Role::Assistant, content: MessageContent::Parts(parts) }
    }
}

impl MessageContent {
    /// Extract the plain-text content (first text part, or the full text).
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t.as_str()),
            MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }

    /// Approximate size in chars, used by the history window.
    pub fn char_len(&self) -> usize {
        match self {
            MessageContent::Text(t) => t.chars().count(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.chars().count(),
                    ContentPart::ToolUse { input, .. } => input.to_string().chars().count(),
                    ContentPart::ToolResult { content, .. } => content.chars().count(),
                })
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_success_content() {
        let result = ToolResult::success("1 passed");
        assert!(result.ok);
        assert_eq!(result.content_for_model(), "1 passed");
    }

    #[test]
    fn tool_result_failure_content_names_kind() {
        let result = ToolResult::failure(ErrorKind::SandboxDenied, "no adapter");
        assert!(!result.ok);
        assert_eq!(result.content_for_model(), "error (sandbox_denied): no adapter");
    }

    #[test]
    fn tool_result_retryable_only_for_transient_kinds() {
        assert!(ToolResult::failure(ErrorKind::Timeout, "t").retryable);
        assert!(ToolResult::failure(ErrorKind::Io, "i").retryable);
        assert!(!ToolResult::failure(ErrorKind::Permission, "p").retryable);
        assert!(!ToolResult::failure(ErrorKind::Validation, "v").retryable);
    }

    #[test]
    fn tool_result_wire_omits_empty_fields() {
        let value = serde_json::to_value(ToolResult::success("hi")).unwrap();
        assert!(value.get("exit_code").is_none());
        assert!(value.get("error_kind").is_none());
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn assistant_with_tool_calls_orders_parts() {
        let calls = vec![ToolCall {
            call_id: "c1".into(),
            tool_name: "shell_exec".into(),
            arguments: serde_json::json!({"argv": ["ls"]}),
        }];
        let msg = Message::assistant_with_tool_calls("running ls", &calls);
        match msg.content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[0], ContentPart::Text { .. }));
                assert!(matches!(parts[1], ContentPart::ToolUse { .. }));
            }
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn char_len_counts_all_parts() {
        let msg = Message::tool_result("c1", "abcd");
        assert_eq!(msg.content.char_len(), 4);
        let plain = Message::user("héllo");
        assert_eq!(plain.content.char_len(), 5);
    }
}
