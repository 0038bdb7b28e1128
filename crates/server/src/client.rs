//! The in-process runtime client: find (or start) the workspace server,
//! authenticate, and expose the RPC surface as plain async methods.

use std::process::Stdio;

use sha2::{Digest, Sha256};
use sr_domain::{Error, Result};
use tokio::net::UnixStream;

use crate::collab::ChildStatus;
use crate::exec_session::SessionOutput;
use crate::paths::ServerPaths;
use crate::proto::{self, Request, RequestEnvelope, Response, ServerInfo};
use crate::registry_file::pid_alive;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Command line that starts a detached runtime server for this
    /// workspace. When unset the client only talks to an already
    /// running server.
    pub spawn_command: Option<Vec<String>>,
    /// How long to wait for a freshly spawned server's socket.
    pub spawn_wait_ms: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stateless adapter: every call opens a connection, sends one or two
/// frames, and reads one response. All state lives in the server.
pub struct RuntimeClient {
    paths: ServerPaths,
    config: ClientConfig,
}

/// Result of `collab.wait` / `collab.close` as seen by tool handlers.
#[derive(Debug, Clone)]
pub struct ChildWaitResult {
    pub status: ChildStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl RuntimeClient {
    pub fn new(paths: ServerPaths, config: ClientConfig) -> Self {
        Self { paths, config }
    }

    fn load_info(&self) -> Option<ServerInfo> {
        let content = std::fs::read_to_string(self.paths.server_json()).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Locate a live server, spawning one if configured to.
    async fn ensure_server(&self) -> Result<ServerInfo> {
        if let Some(info) = self.load_info() {
            if pid_alive(info.pid) && std::path::Path::new(&info.socket_path).exists() {
                return Ok(info);
            }
        }

        let Some(command) = &self.config.spawn_command else {
            return Err(Error::NotFound(
                "runtime server is not running and no spawn command is configured".into(),
            ));
        };
        if command.is_empty() {
            return Err(Error::Config("runtime server spawn command is empty".into()));
        }

        tracing::info!(command = ?command, "spawning runtime server");
        std::fs::create_dir_all(self.paths.root())?;
        let stdout = std::fs::File::create(self.paths.stdout_log())?;
        let stderr = std::fs::File::create(self.paths.stderr_log())?;
        std::process::Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?;

        // Wait for the socket to come up.
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_millis(self.config.spawn_wait_ms);
        loop {
            if let Some(info) = self.load_info() {
                if pid_alive(info.pid) && UnixStream::connect(&info.socket_path).await.is_ok() {
                    return Ok(info);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout("runtime server did not come up".into()));
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    async fn call(&self, request: Request, bytes: Option<&[u8]>) -> Result<Response> {
        let info = self.ensure_server().await?;
        let mut stream = UnixStream::connect(&info.socket_path).await?;

        let envelope = RequestEnvelope { secret: info.secret, request };
        proto::write_frame(&mut stream, &serde_json::to_vec(&envelope)?).await?;
        if let Some(bytes) = bytes {
            proto::write_frame(&mut stream, bytes).await?;
        }

        let frame = proto::read_frame(&mut stream)
            .await?
            .ok_or_else(|| Error::Permission("runtime server closed the connection".into()))?;
        let response: Response = serde_json::from_slice(&frame)?;
        match response {
            Response::Error { kind, message } => Err(Response::into_domain_error(kind, message)),
            other => Ok(other),
        }
    }

    // ── RPC surface ────────────────────────────────────────────────

    pub async fn status(&self) -> Result<(usize, usize)> {
        match self.call(Request::RuntimeStatus, None).await? {
            Response::Status { exec_active, child_active, .. } => Ok((exec_active, child_active)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn cleanup(&self) -> Result<(usize, usize)> {
        match self.call(Request::RuntimeCleanup, None).await? {
            Response::Cleanup { closed, cancelled } => Ok((closed, cancelled)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn exec_start(
        &self,
        cmd: Vec<String>,
        cwd: Option<String>,
        env_keys: Vec<String>,
        yield_time_ms: Option<u64>,
        max_output_tokens: Option<usize>,
    ) -> Result<(u64, SessionOutput)> {
        let request = Request::ExecStart {
            cmd,
            cwd,
            env_keys,
            yield_time_ms,
            max_output_tokens,
            tty: true,
            sandbox: None,
        };
        match self.call(request, None).await? {
            Response::ExecStarted { session_id, running, initial_output } => Ok((
                session_id,
                SessionOutput {
                    running,
                    output: initial_output.unwrap_or_default(),
                    exit_code: None,
                    truncated: false,
                },
            )),
            other => Err(unexpected(&other)),
        }
    }

    /// Send stdin chars (or poll with an empty string) and collect
    /// output. The plaintext travels only on this socket; callers log
    /// `bytes` + `chars_sha256` instead.
    pub async fn exec_write(
        &self,
        session_id: u64,
        chars: &str,
        yield_time_ms: Option<u64>,
        max_output_tokens: Option<usize>,
    ) -> Result<SessionOutput> {
        let is_poll = chars.is_empty();
        let request = Request::ExecWrite {
            session_id,
            yield_time_ms,
            max_output_tokens,
            bytes: chars.len(),
            chars_sha256: hex::encode(Sha256::digest(chars.as_bytes())),
            is_poll,
        };
        match self.call(request, Some(chars.as_bytes())).await? {
            Response::ExecOutput { running, output, exit_code, truncated } => {
                Ok(SessionOutput { running, output, exit_code, truncated })
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn exec_close(&self, session_id: u64) -> Result<bool> {
        match self.call(Request::ExecClose { session_id }, None).await? {
            Response::ExecClosed { closed } => Ok(closed),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn collab_spawn(&self, message: String, model: Option<String>) -> Result<String> {
        match self.call(Request::CollabSpawn { message, model }, None).await? {
            Response::CollabSpawned { child_id, .. } => Ok(child_id),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn collab_send_input(&self, child_id: String, input: String) -> Result<bool> {
        match self.call(Request::CollabSendInput { child_id, input }, None).await? {
            Response::InputAccepted { accepted } => Ok(accepted),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn collab_wait(
        &self,
        child_id: String,
        timeout_ms: Option<u64>,
    ) -> Result<ChildWaitResult> {
        match self.call(Request::CollabWait { child_id, timeout_ms }, None).await? {
            Response::CollabDone { status, output, error } => {
                Ok(ChildWaitResult { status, output, error })
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn collab_close(&self, child_id: String) -> Result<ChildStatus> {
        match self.call(Request::CollabClose { child_id }, None).await? {
            Response::CollabClosed { status } => Ok(status),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> Error {
    Error::Unknown {
        message: format!("unexpected runtime server response: {response:?}"),
        exception_class: None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::EchoDriver;
    use crate::server::RuntimeServer;
    use sr_domain::config::{ExecConfig, ServerConfig};
    use std::sync::Arc;

    async fn server_and_client(dir: &std::path::Path) -> (Arc<RuntimeServer>, RuntimeClient) {
        let server = RuntimeServer::start(
            ServerPaths::new(dir),
            ExecConfig { timeout_ms: 10_000, yield_time_ms: 200, max_output_chars: 100_000 },
            ServerConfig { idle_timeout_sec: 600, spawn_wait_ms: 2_000 },
            Arc::new(EchoDriver),
        )
        .await
        .unwrap();
        let client = RuntimeClient::new(ServerPaths::new(dir), ClientConfig::default());
        (server, client)
    }

    #[tokio::test]
    async fn no_server_and_no_spawn_command_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let client = RuntimeClient::new(ServerPaths::new(dir.path()), ClientConfig::default());
        let err = client.status().await.unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn status_through_client() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = server_and_client(dir.path()).await;
        assert_eq!(client.status().await.unwrap(), (0, 0));
        server.stop();
    }

    #[tokio::test]
    async fn exec_session_through_client() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = server_and_client(dir.path()).await;

        let (session_id, initial) = client
            .exec_start(vec!["cat".into()], None, vec![], Some(100), None)
            .await
            .unwrap();
        assert!(initial.running);

        let result = client.exec_write(session_id, "hello\n", Some(500), None).await.unwrap();
        assert!(result.output.contains("hello"));

        assert!(client.exec_close(session_id).await.unwrap());
        let err = client.exec_write(session_id, "more\n", Some(100), None).await.unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::NotFound);
        server.stop();
    }

    #[tokio::test]
    async fn collab_through_client() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = server_and_client(dir.path()).await;

        let child_id = client.collab_spawn("wait:".into(), None).await.unwrap();
        assert!(client.collab_send_input(child_id.clone(), "task data".into()).await.unwrap());

        let outcome = client.collab_wait(child_id.clone(), Some(2_000)).await.unwrap();
        assert_eq!(outcome.status, ChildStatus::Completed);
        assert_eq!(outcome.output.as_deref(), Some("echo: task data"));
        server.stop();
    }

    #[tokio::test]
    async fn cleanup_through_client() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = server_and_client(dir.path()).await;

        client.exec_start(vec!["cat".into()], None, vec![], Some(50), None).await.unwrap();
        client.collab_spawn("wait:".into(), None).await.unwrap();

        let (closed, cancelled) = client.cleanup().await.unwrap();
        assert_eq!(closed, 1);
        assert_eq!(cancelled, 1);
        assert_eq!(client.status().await.unwrap().0, 0);
        server.stop();
    }
}
