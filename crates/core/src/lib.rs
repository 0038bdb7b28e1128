//! The Skills Runtime core: the per-workspace engine that executes one
//! run of the agent loop and safely orchestrates its tool calls.
//!
//! A run compiles a prompt (injecting mentioned skills), streams one or
//! more completions from the [`sr_backends::ChatBackend`], pushes every
//! tool call through the policy → approvals → sandbox gate, appends
//! each state transition to the run's WAL, and ends with exactly one
//! terminal event.

pub mod approvals;
pub mod bootstrap;
pub mod cancel;
pub mod controller;
pub mod dispatch;
pub mod emitter;
pub mod human;
pub mod policy;
pub mod prompt;
pub mod resume;
pub mod run;
pub mod sanitize;

pub use approvals::{ApprovalProvider, ApprovalRequest, ApprovalsCache, Decision};
pub use cancel::CancelToken;
pub use human::{HumanIoProvider, HumanRequest};
pub use run::{ResumeStrategy, RunOptions, RunOutcome, RunStatus, Runtime};
