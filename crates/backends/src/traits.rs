use sr_domain::stream::{BoxStream, StreamEvent};
use sr_domain::tool::{Message, ToolDefinition};
use sr_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A backend-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke. Empty disables tools
    /// (compaction turns rely on this).
    pub tools: Vec<ToolDefinition>,
    /// Model identifier override. `None` uses the backend default.
    pub model: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM transport must implement.
///
/// A context-window overflow MUST surface as
/// `Err(Error::ContextLengthExceeded)` from the stream (or from
/// `chat_stream` itself) so the loop controller can run recovery.
/// Retry/backoff is the transport's business, not the loop's.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send a chat completion request and return a stream of deltas.
    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// A short identifier for logs and `run_started` config summaries.
    fn backend_id(&self) -> &str;
}
