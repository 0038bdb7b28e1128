//! PTY-backed interactive exec sessions.
//!
//! Each session spawns its child on a PTY, pumps the master fd into a
//! bounded ring buffer from a dedicated thread, and serves
//! write-then-poll requests: append to stdin, then return whatever
//! output accumulates within `yield_time_ms`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use sr_domain::config::ExecConfig;
use sr_domain::{Error, Result};
use sr_tools::OutputBuffer;

use crate::registry_file::ExecRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Output poll interval while waiting inside a yield window.
const POLL_STEP: Duration = Duration::from_millis(50);

/// Rough chars-per-token factor for `max_output_tokens` caps.
const CHARS_PER_TOKEN: usize = 4;

struct SessionControl {
    child: Box<dyn Child + Send + Sync>,
    writer: Option<Box<dyn Write + Send>>,
    // Held so the PTY pair outlives the child.
    _master: Box<dyn MasterPty + Send>,
    read_offset: usize,
    running: bool,
    exit_code: Option<i32>,
}

pub struct ExecSession {
    pub session_id: u64,
    pub pid: u32,
    buffer: Arc<Mutex<OutputBuffer>>,
    control: Mutex<SessionControl>,
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession")
            .field("session_id", &self.session_id)
            .field("pid", &self.pid)
            .finish()
    }
}

/// What one write-or-poll round returned.
#[derive(Debug, Clone)]
pub struct SessionOutput {
    pub running: bool,
    pub output: String,
    pub exit_code: Option<i32>,
    pub truncated: bool,
}

impl ExecSession {
    fn refresh_status(control: &mut SessionControl) {
        if !control.running {
            return;
        }
        if let Ok(Some(status)) = control.child.try_wait() {
            control.running = false;
            control.exit_code = Some(status.exit_code() as i32);
            control.writer = None;
        }
    }

    /// Write chars to the slave stdin (empty slice = pure poll), then
    /// gather output for up to `yield_time_ms`.
    pub async fn write_and_poll(
        &self,
        chars: &[u8],
        yield_time_ms: u64,
        max_output_tokens: Option<usize>,
    ) -> Result<SessionOutput> {
        if !chars.is_empty() {
            let mut control = self.control.lock();
            Self::refresh_status(&mut control);
            let Some(writer) = control.writer.as_mut() else {
                return Err(Error::NotFound(format!(
                    "session {} is no longer accepting input",
                    self.session_id
                )));
            };
            writer.write_all(chars).map_err(Error::Io)?;
            writer.flush().map_err(Error::Io)?;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(yield_time_ms);
        loop {
            tokio::time::sleep(POLL_STEP).await;
            let exited = {
                let mut control = self.control.lock();
                Self::refresh_status(&mut control);
                !control.running
            };
            if exited || tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        Ok(self.collect(max_output_tokens))
    }

    /// Drain new output since the last read.
    fn collect(&self, max_output_tokens: Option<usize>) -> SessionOutput {
        let mut control = self.control.lock();
        Self::refresh_status(&mut control);
        let buffer = self.buffer.lock();
        let mut output = buffer.read_from(control.read_offset).to_string();
        control.read_offset = buffer.len();
        let mut truncated = buffer.truncated();
        drop(buffer);

        if let Some(tokens) = max_output_tokens {
            let cap = tokens.saturating_mul(CHARS_PER_TOKEN);
            if output.len() > cap {
                let mut cut = output.len() - cap;
                while cut < output.len() && !output.is_char_boundary(cut) {
                    cut += 1;
                }
                output = output[cut..].to_string();
                truncated = true;
            }
        }

        SessionOutput {
            running: control.running,
            output,
            exit_code: control.exit_code,
            truncated,
        }
    }

    /// Kill the child and drain whatever is left.
    fn close(&self) -> SessionOutput {
        {
            let mut control = self.control.lock();
            Self::refresh_status(&mut control);
            if control.running {
                let _ = control.child.kill();
                let _ = control.child.wait();
                control.running = false;
            }
            control.writer = None;
        }
        self.collect(None)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registry of live PTY sessions. Keeps `exec_registry.json` current
/// for orphan cleanup after an unclean server death.
pub struct SessionManager {
    sessions: Mutex<HashMap<u64, Arc<ExecSession>>>,
    next_id: AtomicU64,
    config: ExecConfig,
    registry_path: PathBuf,
    workspace_marker: String,
}

impl SessionManager {
    pub fn new(config: ExecConfig, registry_path: PathBuf, workspace_marker: String) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
            registry_path,
            workspace_marker,
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.sessions.lock().values().map(|s| s.pid).collect()
    }

    pub fn get(&self, session_id: u64) -> Result<Arc<ExecSession>> {
        self.sessions
            .lock()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no exec session {session_id}")))
    }

    /// Spawn a PTY child and start its output pump.
    ///
    /// `env_keys` name vars resolved from the *server's* environment;
    /// values never travel over the socket.
    pub async fn start(
        &self,
        cmd: &[String],
        cwd: Option<&str>,
        env_keys: &[String],
        yield_time_ms: Option<u64>,
        max_output_tokens: Option<usize>,
    ) -> Result<(u64, SessionOutput)> {
        if cmd.is_empty() {
            return Err(Error::Validation("exec.start cmd must not be empty".into()));
        }

        let pty = native_pty_system()
            .openpty(PtySize { rows: 24, cols: 120, pixel_width: 0, pixel_height: 0 })
            .map_err(|e| Error::Unknown { message: e.to_string(), exception_class: None })?;

        let mut builder = CommandBuilder::new(&cmd[0]);
        builder.args(&cmd[1..]);
        if let Some(dir) = cwd {
            builder.cwd(dir);
        }
        for key in env_keys {
            if let Ok(value) = std::env::var(key) {
                builder.env(key, value);
            }
        }

        let child = pty
            .slave
            .spawn_command(builder)
            .map_err(|e| Error::Unknown { message: e.to_string(), exception_class: None })?;
        drop(pty.slave);

        let pid = child.process_id().unwrap_or_default();
        let mut reader = pty
            .master
            .try_clone_reader()
            .map_err(|e| Error::Unknown { message: e.to_string(), exception_class: None })?;
        let writer = pty
            .master
            .take_writer()
            .map_err(|e| Error::Unknown { message: e.to_string(), exception_class: None })?;

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.config.max_output_chars)));
        let pump_buffer = Arc::clone(&buffer);
        // The PTY reader is blocking; pump it from a plain thread.
        std::thread::spawn(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => pump_buffer.lock().push(&String::from_utf8_lossy(&chunk[..n])),
                }
            }
        });

        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(ExecSession {
            session_id,
            pid,
            buffer,
            control: Mutex::new(SessionControl {
                child,
                writer: Some(writer),
                _master: pty.master,
                read_offset: 0,
                running: true,
                exit_code: None,
            }),
        });
        self.sessions.lock().insert(session_id, Arc::clone(&session));
        self.record_registry();
        tracing::info!(session_id, pid, cmd = ?cmd, "exec session started");

        let initial = session
            .write_and_poll(b"", yield_time_ms.unwrap_or(self.config.yield_time_ms), max_output_tokens)
            .await?;
        Ok((session_id, initial))
    }

    /// Terminate and forget a session. Returns the drained tail.
    pub fn close(&self, session_id: u64) -> Result<SessionOutput> {
        let session = {
            let mut sessions = self.sessions.lock();
            sessions
                .remove(&session_id)
                .ok_or_else(|| Error::NotFound(format!("no exec session {session_id}")))?
        };
        let tail = session.close();
        self.record_registry();
        tracing::info!(session_id, "exec session closed");
        Ok(tail)
    }

    /// Best-effort teardown of everything. Returns how many closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<ExecSession>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        let count = drained.len();
        for session in drained {
            let _ = session.close();
        }
        self.record_registry();
        count
    }

    fn record_registry(&self) {
        let mut registry = ExecRegistry::default();
        for pid in self.pids() {
            if pid != 0 {
                registry.add(pid, &self.workspace_marker);
            }
        }
        if let Err(e) = registry.save(&self.registry_path) {
            tracing::warn!(error = %e, "failed to update exec registry");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &std::path::Path) -> SessionManager {
        SessionManager::new(
            ExecConfig { timeout_ms: 10_000, yield_time_ms: 300, max_output_chars: 100_000 },
            dir.join("exec_registry.json"),
            dir.display().to_string(),
        )
    }

    #[tokio::test]
    async fn cat_session_echoes_input() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let (session_id, _initial) = manager
            .start(&["cat".into()], None, &[], Some(200), None)
            .await
            .unwrap();

        let session = manager.get(session_id).unwrap();
        let result = session.write_and_poll(b"hello\n", 500, None).await.unwrap();
        assert!(result.running);
        assert!(result.output.contains("hello"), "output was {:?}", result.output);

        let tail = manager.close(session_id).unwrap();
        assert!(!tail.running || tail.exit_code.is_none());
        assert!(manager.get(session_id).is_err());
    }

    #[tokio::test]
    async fn short_lived_child_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let (session_id, _) = manager
            .start(&["sh".into(), "-c".into(), "echo done".into()], None, &[], Some(100), None)
            .await
            .unwrap();

        let session = manager.get(session_id).unwrap();
        // Give the child time to exit, then poll.
        let result = session.write_and_poll(b"", 800, None).await.unwrap();
        assert!(!result.running);
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert_eq!(
            manager.get(999).unwrap_err().kind(),
            sr_domain::ErrorKind::NotFound
        );
        assert_eq!(
            manager.close(999).unwrap_err().kind(),
            sr_domain::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn empty_cmd_is_validation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let err = manager.start(&[], None, &[], None, None).await.unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn registry_tracks_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let (session_id, _) = manager
            .start(&["cat".into()], None, &[], Some(100), None)
            .await
            .unwrap();
        let registry = ExecRegistry::load(&dir.path().join("exec_registry.json"));
        assert_eq!(registry.entries.len(), 1);

        manager.close(session_id).unwrap();
        let registry = ExecRegistry::load(&dir.path().join("exec_registry.json"));
        assert!(registry.entries.is_empty());
    }

    #[tokio::test]
    async fn close_all_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.start(&["cat".into()], None, &[], Some(50), None).await.unwrap();
        manager.start(&["cat".into()], None, &[], Some(50), None).await.unwrap();
        assert_eq!(manager.active_count(), 2);
        assert_eq!(manager.close_all(), 2);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn max_output_tokens_caps_tail() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let (session_id, _) = manager
            .start(
                &["sh".into(), "-c".into(), "yes x | head -c 5000".into()],
                None,
                &[],
                Some(50),
                None,
            )
            .await
            .unwrap();
        let session = manager.get(session_id).unwrap();
        let result = session.write_and_poll(b"", 800, Some(10)).await.unwrap();
        assert!(result.output.len() <= 40);
        assert!(result.truncated);
        let _ = manager.close(session_id);
    }
}
