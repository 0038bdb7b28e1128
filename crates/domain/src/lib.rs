//! Shared domain types for the Skills Runtime: events, tool calls,
//! stream deltas, the error taxonomy, and the runtime config tree.
//!
//! Every other crate in the workspace depends on this one; it depends
//! on nothing but serde and friends.

pub mod config;
pub mod error;
pub mod event;
pub mod stream;
pub mod tool;

pub use error::{Error, ErrorKind, Result};
pub use event::{Event, EventKind};
