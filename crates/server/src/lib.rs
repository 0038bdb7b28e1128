//! The workspace runtime server: an out-of-process singleton that keeps
//! PTY exec sessions and collaborative child agents alive across client
//! invocations, plus the in-process client that talks to it.
//!
//! Transport is JSON over a `0600` Unix stream socket with 4-byte
//! length-prefixed frames; bulk bytes (stdin chars) travel in a second
//! frame after the JSON header. Every request carries the shared secret
//! from `server.json`.

pub mod client;
pub mod collab;
pub mod exec_session;
pub mod handlers;
pub mod paths;
pub mod proto;
pub mod registry_file;
pub mod server;

pub use client::RuntimeClient;
pub use collab::{ChildAgentDriver, ChildStatus};
pub use paths::ServerPaths;
pub use server::RuntimeServer;
