//! Tool handlers backed by the runtime client.
//!
//! These are the persistent-session counterparts of the direct argv
//! path: `exec_command` opens an interactive PTY session on the server,
//! `write_stdin` feeds it, and the `*_agent` tools manage collaborative
//! children. The dispatcher sanitizes all of these before anything is
//! logged; plaintext stdin chars exist only on the socket.

use std::sync::Arc;

use serde::Deserialize;
use sr_domain::tool::{ToolDefinition, ToolResult};
use sr_domain::ErrorKind;
use sr_tools::{SafetyDescriptor, SanitizerKind, ToolExecutionContext, ToolHandler};

use crate::client::RuntimeClient;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// exec_command
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct ExecCommandRequest {
    cmd: String,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    env_keys: Vec<String>,
    #[serde(default)]
    yield_time_ms: Option<u64>,
    #[serde(default)]
    max_output_tokens: Option<usize>,
}

/// Start a persistent interactive exec session on the runtime server.
pub struct ExecCommandHandler {
    client: Arc<RuntimeClient>,
}

impl ExecCommandHandler {
    pub fn new(client: Arc<RuntimeClient>) -> Self {
        Self { client }
    }

    pub fn definition() -> ToolDefinition {
        ToolDefinition {
            name: "exec_command".into(),
            description: "Start an interactive shell command in a persistent PTY session. Returns a session_id for write_stdin.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "cmd": { "type": "string", "description": "Shell command line" },
                    "workdir": { "type": "string", "description": "Working directory" },
                    "env_keys": { "type": "array", "description": "Env var names the server resolves locally" },
                    "yield_time_ms": { "type": "integer", "description": "How long to collect initial output" },
                    "max_output_tokens": { "type": "integer", "description": "Cap on returned output" }
                },
                "required": ["cmd"]
            }),
        }
    }

    pub fn descriptor() -> SafetyDescriptor {
        SafetyDescriptor::builtin(SanitizerKind::ShellString)
    }
}

#[async_trait::async_trait]
impl ToolHandler for ExecCommandHandler {
    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolExecutionContext) -> ToolResult {
        let req: ExecCommandRequest = match serde_json::from_value(arguments) {
            Ok(r) => r,
            Err(e) => return ToolResult::failure(ErrorKind::Validation, e.to_string()),
        };
        let cwd = match req.workdir.as_deref() {
            Some(raw) => match ctx.resolve_path(raw) {
                Ok(path) => Some(path.display().to_string()),
                Err(e) => return ToolResult::failure(e.kind(), e.to_string()),
            },
            None => Some(ctx.workspace_root.display().to_string()),
        };

        // Interactive sessions always run under a shell on the PTY.
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), req.cmd];
        match self
            .client
            .exec_start(argv, cwd, req.env_keys, req.yield_time_ms, req.max_output_tokens)
            .await
        {
            Ok((session_id, initial)) => ToolResult::success(initial.output).with_data(serde_json::json!({
                "session_id": session_id,
                "running": initial.running,
            })),
            Err(e) => ToolResult::failure(e.kind(), e.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// write_stdin
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct WriteStdinRequest {
    session_id: u64,
    #[serde(default)]
    chars: String,
    #[serde(default)]
    yield_time_ms: Option<u64>,
    #[serde(default)]
    max_output_tokens: Option<usize>,
}

/// Feed chars to a session (empty = poll) and return fresh output.
pub struct WriteStdinHandler {
    client: Arc<RuntimeClient>,
}

impl WriteStdinHandler {
    pub fn new(client: Arc<RuntimeClient>) -> Self {
        Self { client }
    }

    pub fn definition() -> ToolDefinition {
        ToolDefinition {
            name: "write_stdin".into(),
            description: "Write characters to an exec session's stdin (empty string polls) and return new output.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "session_id": { "type": "integer", "description": "Session from exec_command" },
                    "chars": { "type": "string", "description": "Characters to write (include \\n to submit)" },
                    "yield_time_ms": { "type": "integer", "description": "How long to wait for output" },
                    "max_output_tokens": { "type": "integer", "description": "Cap on returned output" }
                },
                "required": ["session_id"]
            }),
        }
    }

    pub fn descriptor() -> SafetyDescriptor {
        SafetyDescriptor::builtin(SanitizerKind::WriteStdin)
    }
}

#[async_trait::async_trait]
impl ToolHandler for WriteStdinHandler {
    async fn execute(&self, arguments: serde_json::Value, _ctx: &ToolExecutionContext) -> ToolResult {
        let req: WriteStdinRequest = match serde_json::from_value(arguments) {
            Ok(r) => r,
            Err(e) => return ToolResult::failure(ErrorKind::Validation, e.to_string()),
        };
        match self
            .client
            .exec_write(req.session_id, &req.chars, req.yield_time_ms, req.max_output_tokens)
            .await
        {
            Ok(result) => {
                let mut tool_result = ToolResult::success(result.output);
                tool_result.exit_code = result.exit_code;
                tool_result.truncated = result.truncated;
                tool_result.with_data(serde_json::json!({ "running": result.running }))
            }
            Err(e) => ToolResult::failure(e.kind(), e.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Child agent tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

macro_rules! collab_handler {
    ($name:ident, $tool:literal, $desc:literal, $params:tt, $req:ident, $body:expr) => {
        pub struct $name {
            client: Arc<RuntimeClient>,
        }

        impl $name {
            pub fn new(client: Arc<RuntimeClient>) -> Self {
                Self { client }
            }

            pub fn definition() -> ToolDefinition {
                ToolDefinition {
                    name: $tool.into(),
                    description: $desc.into(),
                    parameters: serde_json::json!($params),
                }
            }

            pub fn descriptor() -> SafetyDescriptor {
                SafetyDescriptor::builtin(SanitizerKind::Passthrough)
            }
        }

        #[async_trait::async_trait]
        impl ToolHandler for $name {
            async fn execute(
                &self,
                arguments: serde_json::Value,
                _ctx: &ToolExecutionContext,
            ) -> ToolResult {
                let req: $req = match serde_json::from_value(arguments) {
                    Ok(r) => r,
                    Err(e) => return ToolResult::failure(ErrorKind::Validation, e.to_string()),
                };
                let client = Arc::clone(&self.client);
                let run = $body;
                run(client, req).await
            }
        }
    };
}

#[derive(Debug, Deserialize)]
struct SpawnAgentRequest {
    message: String,
    #[serde(default)]
    model: Option<String>,
}

collab_handler!(
    SpawnAgentHandler,
    "spawn_agent",
    "Spawn a collaborative child agent on the runtime server. Returns its child_id.",
    {
        "type": "object",
        "properties": {
            "message": { "type": "string", "description": "Task for the child agent" },
            "model": { "type": "string", "description": "Optional model override" }
        },
        "required": ["message"]
    },
    SpawnAgentRequest,
    |client: Arc<RuntimeClient>, req: SpawnAgentRequest| async move {
        match client.collab_spawn(req.message, req.model).await {
            Ok(child_id) => ToolResult::success(child_id.clone())
                .with_data(serde_json::json!({ "child_id": child_id, "status": "running" })),
            Err(e) => ToolResult::failure(e.kind(), e.to_string()),
        }
    }
);

#[derive(Debug, Deserialize)]
struct SendInputRequest {
    child_id: String,
    input: String,
}

collab_handler!(
    SendInputHandler,
    "send_input",
    "Queue an input line for a running child agent.",
    {
        "type": "object",
        "properties": {
            "child_id": { "type": "string", "description": "Child agent id" },
            "input": { "type": "string", "description": "Input line" }
        },
        "required": ["child_id", "input"]
    },
    SendInputRequest,
    |client: Arc<RuntimeClient>, req: SendInputRequest| async move {
        match client.collab_send_input(req.child_id, req.input).await {
            Ok(accepted) => ToolResult::success(if accepted { "accepted" } else { "rejected" })
                .with_data(serde_json::json!({ "accepted": accepted })),
            Err(e) => ToolResult::failure(e.kind(), e.to_string()),
        }
    }
);

#[derive(Debug, Deserialize)]
struct WaitAgentRequest {
    child_id: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

collab_handler!(
    WaitAgentHandler,
    "wait",
    "Wait for a child agent to finish (or until the timeout) and return its output.",
    {
        "type": "object",
        "properties": {
            "child_id": { "type": "string", "description": "Child agent id" },
            "timeout_ms": { "type": "integer", "description": "Max wait in milliseconds" }
        },
        "required": ["child_id"]
    },
    WaitAgentRequest,
    |client: Arc<RuntimeClient>, req: WaitAgentRequest| async move {
        match client.collab_wait(req.child_id, req.timeout_ms).await {
            Ok(outcome) => {
                let text = outcome.output.clone().or(outcome.error.clone()).unwrap_or_default();
                ToolResult::success(text).with_data(serde_json::json!({
                    "status": outcome.status,
                    "output": outcome.output,
                    "error": outcome.error,
                }))
            }
            Err(e) => ToolResult::failure(e.kind(), e.to_string()),
        }
    }
);

#[derive(Debug, Deserialize)]
struct CloseAgentRequest {
    child_id: String,
}

collab_handler!(
    CloseAgentHandler,
    "close_agent",
    "Cooperatively cancel a child agent.",
    {
        "type": "object",
        "properties": {
            "child_id": { "type": "string", "description": "Child agent id" }
        },
        "required": ["child_id"]
    },
    CloseAgentRequest,
    |client: Arc<RuntimeClient>, req: CloseAgentRequest| async move {
        match client.collab_close(req.child_id).await {
            Ok(status) => ToolResult::success("cancelled")
                .with_data(serde_json::json!({ "status": status })),
            Err(e) => ToolResult::failure(e.kind(), e.to_string()),
        }
    }
);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::collab::EchoDriver;
    use crate::paths::ServerPaths;
    use crate::server::RuntimeServer;
    use sr_domain::config::{ExecConfig, ServerConfig};

    async fn setup(dir: &std::path::Path) -> (Arc<RuntimeServer>, Arc<RuntimeClient>) {
        let server = RuntimeServer::start(
            ServerPaths::new(dir),
            ExecConfig { timeout_ms: 10_000, yield_time_ms: 200, max_output_chars: 100_000 },
            ServerConfig { idle_timeout_sec: 600, spawn_wait_ms: 2_000 },
            Arc::new(EchoDriver),
        )
        .await
        .unwrap();
        let client = Arc::new(RuntimeClient::new(ServerPaths::new(dir), ClientConfig::default()));
        (server, client)
    }

    fn ctx(dir: &std::path::Path) -> ToolExecutionContext {
        ToolExecutionContext::new(dir, 10_000)
    }

    #[tokio::test]
    async fn exec_command_then_write_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = setup(dir.path()).await;

        let start = ExecCommandHandler::new(Arc::clone(&client))
            .execute(serde_json::json!({"cmd": "cat", "yield_time_ms": 100}), &ctx(dir.path()))
            .await;
        assert!(start.ok, "{start:?}");
        let session_id = start.data.as_ref().unwrap()["session_id"].as_u64().unwrap();

        let write = WriteStdinHandler::new(Arc::clone(&client))
            .execute(
                serde_json::json!({"session_id": session_id, "chars": "ping\n", "yield_time_ms": 500}),
                &ctx(dir.path()),
            )
            .await;
        assert!(write.ok);
        assert!(write.stdout.unwrap().contains("ping"));
        server.stop();
    }

    #[tokio::test]
    async fn write_stdin_to_missing_session() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = setup(dir.path()).await;

        let result = WriteStdinHandler::new(client)
            .execute(
                serde_json::json!({"session_id": 404, "chars": "x\n"}),
                &ctx(dir.path()),
            )
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::NotFound));
        server.stop();
    }

    #[tokio::test]
    async fn agent_tools_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = setup(dir.path()).await;

        let spawned = SpawnAgentHandler::new(Arc::clone(&client))
            .execute(serde_json::json!({"message": "wait:"}), &ctx(dir.path()))
            .await;
        assert!(spawned.ok);
        let child_id = spawned.data.as_ref().unwrap()["child_id"].as_str().unwrap().to_string();

        let sent = SendInputHandler::new(Arc::clone(&client))
            .execute(
                serde_json::json!({"child_id": child_id, "input": "work item"}),
                &ctx(dir.path()),
            )
            .await;
        assert!(sent.ok);

        let waited = WaitAgentHandler::new(Arc::clone(&client))
            .execute(
                serde_json::json!({"child_id": child_id, "timeout_ms": 2000}),
                &ctx(dir.path()),
            )
            .await;
        assert!(waited.ok);
        assert_eq!(waited.stdout.as_deref(), Some("echo: work item"));
        server.stop();
    }

    #[tokio::test]
    async fn close_agent_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = setup(dir.path()).await;

        let spawned = SpawnAgentHandler::new(Arc::clone(&client))
            .execute(serde_json::json!({"message": "wait:"}), &ctx(dir.path()))
            .await;
        let child_id = spawned.data.as_ref().unwrap()["child_id"].as_str().unwrap().to_string();

        let closed = CloseAgentHandler::new(client)
            .execute(serde_json::json!({"child_id": child_id}), &ctx(dir.path()))
            .await;
        assert!(closed.ok);
        assert_eq!(closed.data.as_ref().unwrap()["status"], "cancelled");
        server.stop();
    }
}
