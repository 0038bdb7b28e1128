//! A scripted backend that replays canned turns, for offline tests.

use parking_lot::Mutex;
use sr_domain::stream::{BoxStream, StreamEvent, Usage};
use sr_domain::{Error, Result};

use crate::traits::{ChatBackend, ChatRequest};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ScriptedTurn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One canned completion. Each `chat_stream` call consumes the next
/// turn in the queue.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Stream the events as given, then end.
    Events(Vec<StreamEvent>),
    /// Fail immediately with a context-window overflow.
    ContextOverflow,
    /// Fail immediately with a backend error message.
    Fail(String),
}

impl ScriptedTurn {
    /// Convenience: one text delta then a clean stop.
    pub fn text(content: &str) -> Self {
        Self::Events(vec![
            StreamEvent::Token { text: content.to_string() },
            StreamEvent::Done {
                usage: Some(Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 }),
                finish_reason: Some("stop".into()),
            },
        ])
    }

    /// Convenience: a single finalized tool call, no text.
    pub fn tool_call(call_id: &str, tool_name: &str, arguments: serde_json::Value) -> Self {
        Self::Events(vec![
            StreamEvent::ToolCallStarted {
                call_id: call_id.to_string(),
                tool_name: tool_name.to_string(),
            },
            StreamEvent::ToolCallFinished {
                call_id: call_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments,
            },
            StreamEvent::Done {
                usage: Some(Usage { prompt_tokens: 20, completion_tokens: 8, total_tokens: 28 }),
                finish_reason: Some("tool_calls".into()),
            },
        ])
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ScriptedBackend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Replays a fixed queue of [`ScriptedTurn`]s. Running past the end of
/// the script is a test bug and fails loudly as a backend error.
pub struct ScriptedBackend {
    turns: Mutex<std::collections::VecDeque<ScriptedTurn>>,
    /// Requests actually received, for assertions.
    seen: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// The requests this backend has served, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait::async_trait]
impl ChatBackend for ScriptedBackend {
    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.seen.lock().push(req);
        let turn = self
            .turns
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Backend("scripted backend ran out of turns".into()))?;

        match turn {
            ScriptedTurn::ContextOverflow => Err(Error::ContextLengthExceeded),
            ScriptedTurn::Fail(message) => Err(Error::Backend(message)),
            ScriptedTurn::Events(events) => {
                let stream = async_stream::stream! {
                    for event in events {
                        yield Ok(event);
                    }
                };
                Ok(Box::pin(stream))
            }
        }
    }

    fn backend_id(&self) -> &str {
        "scripted"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
