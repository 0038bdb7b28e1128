//! The runtime server process: accept loop, auth, lifecycle.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use sr_domain::config::{ExecConfig, ServerConfig};
use sr_domain::{ErrorKind, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collab::{ChildAgentDriver, ChildManager};
use crate::exec_session::SessionManager;
use crate::paths::ServerPaths;
use crate::proto::{self, Request, RequestEnvelope, Response, ServerInfo};
use crate::registry_file;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RuntimeServer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-workspace singleton hosting exec sessions and child agents.
///
/// On start it sweeps orphans from the previous incarnation, binds the
/// `0600` socket, and publishes `server.json` (also `0600`) with the
/// fresh secret. Requests with a wrong secret are dropped without a
/// response body.
pub struct RuntimeServer {
    paths: ServerPaths,
    secret: String,
    pub sessions: Arc<SessionManager>,
    pub children: Arc<ChildManager>,
    shutdown: CancellationToken,
    last_activity: Mutex<Instant>,
    idle_timeout: Duration,
}

impl RuntimeServer {
    pub async fn start(
        paths: ServerPaths,
        exec_config: ExecConfig,
        server_config: ServerConfig,
        driver: Arc<dyn ChildAgentDriver>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(paths.root())?;

        // Sweep children a previous server left behind.
        let swept = registry_file::cleanup_orphans(&paths.exec_registry(), &paths.workspace_marker());
        if swept > 0 {
            tracing::warn!(swept, "orphaned exec children terminated on startup");
        }

        let socket_path = paths.socket();
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;

        let secret = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let info = ServerInfo {
            pid: std::process::id(),
            secret: secret.clone(),
            socket_path: socket_path.display().to_string(),
            created_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        };
        let server_json = paths.server_json();
        std::fs::write(&server_json, serde_json::to_vec_pretty(&info)?)?;
        std::fs::set_permissions(&server_json, std::fs::Permissions::from_mode(0o600))?;

        let sessions = Arc::new(SessionManager::new(
            exec_config,
            paths.exec_registry(),
            paths.workspace_marker(),
        ));
        let children = Arc::new(ChildManager::new(driver));

        let server = Arc::new(Self {
            paths,
            secret,
            sessions,
            children,
            shutdown: CancellationToken::new(),
            last_activity: Mutex::new(Instant::now()),
            idle_timeout: Duration::from_secs(server_config.idle_timeout_sec),
        });

        let accept_server = Arc::clone(&server);
        tokio::spawn(async move { accept_server.accept_loop(listener).await });

        let idle_server = Arc::clone(&server);
        tokio::spawn(async move { idle_server.idle_watch().await });

        tracing::info!(pid = info.pid, socket = %info.socket_path, "runtime server started");
        Ok(server)
    }

    /// Resolves once the server has shut down.
    pub async fn wait_terminated(&self) {
        self.shutdown.cancelled().await;
    }

    /// Tear everything down: sessions, children, socket, `server.json`.
    pub fn stop(&self) {
        let closed = self.sessions.close_all();
        let cancelled = self.children.cancel_all();
        let _ = std::fs::remove_file(self.paths.socket());
        let _ = std::fs::remove_file(self.paths.server_json());
        self.shutdown.cancel();
        tracing::info!(closed, cancelled, "runtime server stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: UnixListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move { server.handle_connection(stream).await });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept error");
                    }
                },
            }
        }
    }

    async fn idle_watch(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }
            let busy = self.sessions.active_count() > 0 || self.children.active_count() > 0;
            if busy {
                *self.last_activity.lock() = Instant::now();
                continue;
            }
            if self.last_activity.lock().elapsed() >= self.idle_timeout {
                tracing::info!("idle timeout reached, shutting down");
                self.stop();
                return;
            }
        }
    }

    /// One connection may carry many request/response rounds.
    async fn handle_connection(self: Arc<Self>, mut stream: UnixStream) {
        loop {
            let frame = match proto::read_frame(&mut stream).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!(error = %e, "connection read error");
                    return;
                }
            };
            let envelope: RequestEnvelope = match serde_json::from_slice(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed request frame");
                    return;
                }
            };
            // Auth: mismatches are dropped without a response body.
            if envelope.secret != self.secret {
                tracing::warn!("request with bad secret rejected");
                return;
            }
            *self.last_activity.lock() = Instant::now();

            let bytes = if envelope.request.expects_bytes_frame() {
                match proto::read_frame(&mut stream).await {
                    Ok(Some(bytes)) => Some(bytes),
                    _ => return,
                }
            } else {
                None
            };

            let response = self.handle_request(envelope.request, bytes).await;
            let encoded = match serde_json::to_vec(&response) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode response");
                    return;
                }
            };
            if proto::write_frame(&mut stream, &encoded).await.is_err() {
                return;
            }
        }
    }

    async fn handle_request(&self, request: Request, bytes: Option<Vec<u8>>) -> Response {
        match request {
            Request::RuntimeStatus => Response::Status {
                healthy: true,
                exec_active: self.sessions.active_count(),
                child_active: self.children.active_count(),
                registry: self.sessions.pids(),
            },
            Request::RuntimeCleanup => Response::Cleanup {
                closed: self.sessions.close_all(),
                cancelled: self.children.cancel_all(),
            },
            Request::ExecStart { cmd, cwd, env_keys, yield_time_ms, max_output_tokens, tty: _, sandbox: _ } => {
                match self
                    .sessions
                    .start(&cmd, cwd.as_deref(), &env_keys, yield_time_ms, max_output_tokens)
                    .await
                {
                    Ok((session_id, initial)) => Response::ExecStarted {
                        session_id,
                        running: initial.running,
                        initial_output: if initial.output.is_empty() {
                            None
                        } else {
                            Some(initial.output)
                        },
                    },
                    Err(e) => Response::error(e.kind(), e.to_string()),
                }
            }
            Request::ExecWrite { session_id, yield_time_ms, max_output_tokens, bytes: declared, chars_sha256, is_poll } => {
                let chars = bytes.unwrap_or_default();
                if chars.len() != declared {
                    return Response::error(
                        ErrorKind::Validation,
                        format!("bytes frame is {} bytes, header declared {declared}", chars.len()),
                    );
                }
                if !is_poll {
                    let digest = hex::encode(Sha256::digest(&chars));
                    if digest != chars_sha256 {
                        return Response::error(ErrorKind::Validation, "chars digest mismatch");
                    }
                }
                let session = match self.sessions.get(session_id) {
                    Ok(session) => session,
                    Err(e) => return Response::error(e.kind(), e.to_string()),
                };
                let payload = if is_poll { &[][..] } else { &chars[..] };
                match session
                    .write_and_poll(payload, yield_time_ms.unwrap_or(2_000), max_output_tokens)
                    .await
                {
                    Ok(result) => Response::ExecOutput {
                        running: result.running,
                        output: result.output,
                        exit_code: result.exit_code,
                        truncated: result.truncated,
                    },
                    Err(e) => Response::error(e.kind(), e.to_string()),
                }
            }
            Request::ExecClose { session_id } => match self.sessions.close(session_id) {
                Ok(_) => Response::ExecClosed { closed: true },
                Err(e) => Response::error(e.kind(), e.to_string()),
            },
            Request::CollabSpawn { message, model } => {
                let child_id = self.children.spawn(message, model);
                Response::CollabSpawned { child_id, status: crate::collab::ChildStatus::Running }
            }
            Request::CollabSendInput { child_id, input } => {
                match self.children.send_input(&child_id, input) {
                    Ok(accepted) => Response::InputAccepted { accepted },
                    Err(e) => Response::error(e.kind(), e.to_string()),
                }
            }
            Request::CollabWait { child_id, timeout_ms } => {
                match self.children.wait(&child_id, timeout_ms).await {
                    Ok(outcome) => Response::CollabDone {
                        status: outcome.status,
                        output: outcome.output,
                        error: outcome.error,
                    },
                    Err(e) => Response::error(e.kind(), e.to_string()),
                }
            }
            Request::CollabClose { child_id } => match self.children.close(&child_id) {
                Ok(status) => Response::CollabClosed { status },
                Err(e) => Response::error(e.kind(), e.to_string()),
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
