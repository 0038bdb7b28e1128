//! Wire format and message types for the runtime server RPC.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload. A
//! request whose method carries bulk bytes (`exec.write` stdin chars)
//! is followed by exactly one more length-prefixed frame holding the
//! raw bytes — they are never part of the JSON and never logged.

use serde::{Deserialize, Serialize};
use sr_domain::{Error, ErrorKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum frame size (16 MB). Exec output is ring-bounded well below
/// this; anything larger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// server.json
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Contents of `server.json`, written 0600 on server start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub pid: u32,
    pub secret: String,
    pub socket_path: String,
    pub created_at_ms: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Envelope around every request: the shared secret plus the method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub secret: String,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    #[serde(rename = "runtime.status")]
    RuntimeStatus,
    #[serde(rename = "runtime.cleanup")]
    RuntimeCleanup,
    #[serde(rename = "exec.start")]
    ExecStart {
        cmd: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
        /// Env var *names* resolved from the server's own environment;
        /// values never cross the wire.
        #[serde(default)]
        env_keys: Vec<String>,
        #[serde(default)]
        yield_time_ms: Option<u64>,
        #[serde(default)]
        max_output_tokens: Option<usize>,
        #[serde(default = "d_true")]
        tty: bool,
        #[serde(default)]
        sandbox: Option<String>,
    },
    /// Header only; the stdin chars follow in a separate bytes frame.
    #[serde(rename = "exec.write")]
    ExecWrite {
        session_id: u64,
        #[serde(default)]
        yield_time_ms: Option<u64>,
        #[serde(default)]
        max_output_tokens: Option<usize>,
        bytes: usize,
        chars_sha256: String,
        #[serde(default)]
        is_poll: bool,
    },
    #[serde(rename = "exec.close")]
    ExecClose { session_id: u64 },
    #[serde(rename = "collab.spawn")]
    CollabSpawn {
        message: String,
        #[serde(default)]
        model: Option<String>,
    },
    #[serde(rename = "collab.send_input")]
    CollabSendInput { child_id: String, input: String },
    #[serde(rename = "collab.wait")]
    CollabWait {
        child_id: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    #[serde(rename = "collab.close")]
    CollabClose { child_id: String },
}

fn d_true() -> bool {
    true
}

impl Request {
    /// Does a bytes frame follow the JSON header?
    pub fn expects_bytes_frame(&self) -> bool {
        matches!(self, Request::ExecWrite { .. })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Status {
        healthy: bool,
        exec_active: usize,
        child_active: usize,
        registry: Vec<u32>,
    },
    Cleanup {
        closed: usize,
        cancelled: usize,
    },
    ExecStarted {
        session_id: u64,
        running: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_output: Option<String>,
    },
    ExecOutput {
        running: bool,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default)]
        truncated: bool,
    },
    ExecClosed {
        closed: bool,
    },
    CollabSpawned {
        child_id: String,
        status: crate::collab::ChildStatus,
    },
    InputAccepted {
        accepted: bool,
    },
    CollabDone {
        status: crate::collab::ChildStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CollabClosed {
        status: crate::collab::ChildStatus,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Response {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error { kind, message: message.into() }
    }

    /// Turn an error response into the matching domain error.
    pub fn into_domain_error(kind: ErrorKind, message: String) -> Error {
        match kind {
            ErrorKind::Validation => Error::Validation(message),
            ErrorKind::Permission => Error::Permission(message),
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::SandboxDenied => Error::SandboxDenied(message),
            ErrorKind::Timeout => Error::Timeout(message),
            ErrorKind::HumanRequired => Error::HumanRequired(message),
            ErrorKind::Cancelled => Error::Cancelled(message),
            ErrorKind::Budget => Error::Budget(message),
            ErrorKind::Io => Error::Unknown { message, exception_class: None },
            ErrorKind::ConfigError => Error::Config(message),
            ErrorKind::ContextLengthExceeded => Error::ContextLengthExceeded,
            ErrorKind::Unknown => Error::Unknown { message, exception_class: None },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Framing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read one length-prefixed frame. `Ok(None)` means the peer closed
/// the connection cleanly before a new frame started.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> sr_domain::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Validation(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> sr_domain::Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(Error::Validation(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_SIZE} byte limit",
            data.len()
        )));
    }
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
