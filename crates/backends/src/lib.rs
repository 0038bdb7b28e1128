//! LLM backend seam. The runtime consumes [`ChatBackend`]; real
//! transports (HTTP/SSE adapters) live outside the core. The scripted
//! backend here powers offline and deterministic-replay tests.

mod scripted;
mod traits;

pub use scripted::{ScriptedBackend, ScriptedTurn};
pub use traits::{ChatBackend, ChatRequest};
