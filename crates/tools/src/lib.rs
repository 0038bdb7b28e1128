//! Tool registry, execution context, sandbox seam, and the builtin
//! handlers (argv shell exec, file write).
//!
//! The dispatch pipeline itself (validate → sanitize → gate → sandbox →
//! handler) lives in the core crate; this crate holds the capability
//! table it drives.

pub mod buffer;
pub mod context;
pub mod file_write;
pub mod intent;
pub mod registry;
pub mod sandbox;
pub mod shell;

pub use buffer::OutputBuffer;
pub use intent::{parse_intent, Intent};
pub use context::ToolExecutionContext;
pub use registry::{validate_arguments, SafetyDescriptor, SanitizerKind, ToolEntry, ToolHandler, ToolRegistry};
pub use sandbox::{SandboxAdapter, SandboxInfo, SandboxLevel};
