//! `shell_exec` — the argv execution path.
//!
//! No shell is involved: `argv[0]` is spawned directly with the given
//! arguments. The shell-string wrapper tools parse intent and funnel
//! into this path (or `/bin/sh -c` for approved complex strings).

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Instant;

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use sr_domain::tool::{ToolDefinition, ToolResult};
use sr_domain::ErrorKind;

use crate::buffer::OutputBuffer;
use crate::context::ToolExecutionContext;
use crate::registry::{SafetyDescriptor, SanitizerKind, ToolHandler};
use crate::sandbox::SandboxLevel;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct ShellExecRequest {
    pub argv: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Extra environment variables for this call only.
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub sandbox: Option<SandboxLevel>,
}

/// Env var names that may not be overridden per call.
fn is_dangerous_env_var(name: &str) -> bool {
    const BLOCKED: &[&str] = &[
        "LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT",
        "DYLD_INSERT_LIBRARIES", "DYLD_LIBRARY_PATH",
        "PATH", "HOME", "SHELL",
        "BASH_ENV", "ENV", "IFS",
        "PYTHONPATH", "PYTHONSTARTUP", "NODE_OPTIONS",
    ];
    let upper = name.to_ascii_uppercase();
    BLOCKED.contains(&upper.as_str())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ShellExecHandler {
    max_output_chars: usize,
}

impl ShellExecHandler {
    pub fn new(max_output_chars: usize) -> Self {
        Self { max_output_chars }
    }

    pub fn definition() -> ToolDefinition {
        ToolDefinition {
            name: "shell_exec".into(),
            description: "Run a program directly (argv form, no shell). Returns stdout, stderr and the exit code.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "argv": { "type": "array", "description": "Program and arguments, e.g. [\"pytest\", \"-q\"]" },
                    "cwd": { "type": "string", "description": "Working directory (inside the workspace)" },
                    "timeout_ms": { "type": "integer", "description": "Hard timeout in milliseconds" },
                    "env": { "type": "object", "description": "Extra environment variables" },
                    "sandbox": { "type": "string", "description": "\"restricted\" to require OS confinement" }
                },
                "required": ["argv"]
            }),
        }
    }

    pub fn descriptor() -> SafetyDescriptor {
        SafetyDescriptor::builtin(SanitizerKind::ShellArgv).with_sandbox()
    }
}

#[async_trait::async_trait]
impl ToolHandler for ShellExecHandler {
    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolExecutionContext) -> ToolResult {
        let req: ShellExecRequest = match serde_json::from_value(arguments) {
            Ok(r) => r,
            Err(e) => return ToolResult::failure(ErrorKind::Validation, e.to_string()),
        };
        if req.argv.is_empty() {
            return ToolResult::failure(ErrorKind::Validation, "argv must not be empty");
        }
        if let Some(env) = &req.env {
            for key in env.keys() {
                if is_dangerous_env_var(key) {
                    return ToolResult::failure(
                        ErrorKind::Permission,
                        format!("environment variable {key:?} may not be overridden"),
                    );
                }
            }
        }

        let cwd = match req.cwd.as_deref() {
            Some(raw) => match ctx.resolve_path(raw) {
                Ok(path) => path,
                Err(e) => return ToolResult::failure(e.kind(), e.to_string()),
            },
            None => ctx.workspace_root.clone(),
        };

        // Apply the fence when one was acquired for this call.
        let argv = match &ctx.sandbox {
            Some(adapter) => match adapter.wrap(req.argv.clone(), &ctx.workspace_root) {
                Ok(wrapped) => wrapped,
                Err(e) => return ToolResult::failure(ErrorKind::SandboxDenied, e.to_string()),
            },
            None => req.argv.clone(),
        };

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&cwd)
            .envs(ctx.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = &req.env {
            command.envs(env);
        }

        let started = Instant::now();
        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                let kind = if e.kind() == std::io::ErrorKind::NotFound {
                    ErrorKind::NotFound
                } else {
                    ErrorKind::Io
                };
                return ToolResult::failure(kind, format!("failed to spawn {:?}: {e}", argv[0]));
            }
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let max = self.max_output_chars;
        let stdout_task = tokio::spawn(async move { drain(&mut stdout_pipe, max).await });
        let stderr_task = tokio::spawn(async move { drain(&mut stderr_pipe, max).await });

        let timeout_ms = req.timeout_ms.unwrap_or(ctx.timeout_ms);
        let timed_out;
        let status = tokio::select! {
            status = child.wait() => { timed_out = false; status.ok() }
            _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
                timed_out = true;
                let _ = child.kill().await;
                None
            }
        };

        let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();
        let duration_ms = started.elapsed().as_millis() as u64;

        if timed_out {
            let mut result =
                ToolResult::failure(ErrorKind::Timeout, format!("command timed out after {timeout_ms}ms"));
            result.stdout = Some(stdout);
            result.truncated = stdout_truncated || stderr_truncated;
            return result.with_duration(duration_ms);
        }

        let exit_code = status.and_then(|s| s.code());
        let ok = exit_code == Some(0);
        ToolResult {
            ok,
            exit_code,
            stdout: Some(stdout),
            stderr: Some(stderr),
            duration_ms,
            truncated: stdout_truncated || stderr_truncated,
            data: None,
            error_kind: if ok { None } else { Some(ErrorKind::Unknown) },
            retryable: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// shell_command — the shell-string wrapper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct ShellCommandRequest {
    pub command: String,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

/// Thin wrapper over the argv path: a simple string runs as its parsed
/// words; a complex one (already flagged for the gate by intent
/// parsing) runs under `/bin/sh -c` once approved.
pub struct ShellCommandHandler {
    inner: ShellExecHandler,
}

impl ShellCommandHandler {
    pub fn new(max_output_chars: usize) -> Self {
        Self { inner: ShellExecHandler::new(max_output_chars) }
    }

    pub fn definition() -> ToolDefinition {
        ToolDefinition {
            name: "shell_command".into(),
            description: "Run a shell command line. Simple commands are executed directly; pipes and operators run under /bin/sh.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Command line to run" },
                    "workdir": { "type": "string", "description": "Working directory (inside the workspace)" },
                    "timeout_ms": { "type": "integer", "description": "Hard timeout in milliseconds" },
                    "env": { "type": "object", "description": "Extra environment variables" }
                },
                "required": ["command"]
            }),
        }
    }

    pub fn descriptor() -> SafetyDescriptor {
        SafetyDescriptor::builtin(SanitizerKind::ShellString).with_sandbox()
    }
}

#[async_trait::async_trait]
impl ToolHandler for ShellCommandHandler {
    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolExecutionContext) -> ToolResult {
        let req: ShellCommandRequest = match serde_json::from_value(arguments) {
            Ok(r) => r,
            Err(e) => return ToolResult::failure(ErrorKind::Validation, e.to_string()),
        };
        let intent = crate::intent::parse_intent(&req.command);
        let argv = if intent.is_complex || intent.argv.is_empty() {
            vec!["/bin/sh".to_string(), "-c".to_string(), req.command]
        } else {
            intent.argv
        };
        let inner_args = serde_json::json!({
            "argv": argv,
            "cwd": req.workdir,
            "timeout_ms": req.timeout_ms,
            "env": req.env,
        });
        self.inner.execute(inner_args, ctx).await
    }
}

async fn drain(
    pipe: &mut Option<impl tokio::io::AsyncRead + Unpin>,
    max_chars: usize,
) -> (String, bool) {
    let mut buffer = OutputBuffer::new(max_chars);
    if let Some(pipe) = pipe {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.push(&String::from_utf8_lossy(&chunk[..n])),
            }
        }
    }
    let truncated = buffer.truncated();
    (buffer.take(), truncated)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dir: &std::path::Path) -> ToolExecutionContext {
        ToolExecutionContext::new(dir, 5_000)
    }

    #[tokio::test]
    async fn runs_argv_and_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ShellExecHandler::new(10_000);
        let result = handler
            .execute(serde_json::json!({"argv": ["echo", "hello"]}), &ctx(dir.path()))
            .await;
        assert!(result.ok);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.as_deref().map(str::trim), Some("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_ok() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ShellExecHandler::new(10_000);
        let result = handler
            .execute(serde_json::json!({"argv": ["false"]}), &ctx(dir.path()))
            .await;
        assert!(!result.ok);
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ShellExecHandler::new(10_000);
        let result = handler
            .execute(
                serde_json::json!({"argv": ["definitely-not-a-real-binary-42"]}),
                &ctx(dir.path()),
            )
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ShellExecHandler::new(10_000);
        let started = Instant::now();
        let result = handler
            .execute(
                serde_json::json!({"argv": ["sleep", "30"], "timeout_ms": 100}),
                &ctx(dir.path()),
            )
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(started.elapsed().as_secs() < 10);
    }

    #[tokio::test]
    async fn empty_argv_is_validation() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ShellExecHandler::new(10_000);
        let result = handler.execute(serde_json::json!({"argv": []}), &ctx(dir.path())).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn dangerous_env_override_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ShellExecHandler::new(10_000);
        let result = handler
            .execute(
                serde_json::json!({"argv": ["echo", "x"], "env": {"LD_PRELOAD": "/tmp/evil.so"}}),
                &ctx(dir.path()),
            )
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Permission));
    }

    #[tokio::test]
    async fn cwd_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ShellExecHandler::new(10_000);
        let result = handler
            .execute(
                serde_json::json!({"argv": ["pwd"], "cwd": "../.."}),
                &ctx(dir.path()),
            )
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Permission));
    }

    #[tokio::test]
    async fn per_call_env_reaches_child() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ShellExecHandler::new(10_000);
        let result = handler
            .execute(
                serde_json::json!({"argv": ["sh", "-c", "echo $GREETING"], "env": {"GREETING": "bonjour"}}),
                &ctx(dir.path()),
            )
            .await;
        assert!(result.ok);
        assert_eq!(result.stdout.as_deref().map(str::trim), Some("bonjour"));
    }

    #[tokio::test]
    async fn shell_command_simple_runs_without_shell() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ShellCommandHandler::new(10_000);
        let result = handler
            .execute(serde_json::json!({"command": "echo plain"}), &ctx(dir.path()))
            .await;
        assert!(result.ok);
        assert_eq!(result.stdout.as_deref().map(str::trim), Some("plain"));
    }

    #[tokio::test]
    async fn shell_command_complex_runs_under_sh() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ShellCommandHandler::new(10_000);
        let result = handler
            .execute(
                serde_json::json!({"command": "echo one && echo two"}),
                &ctx(dir.path()),
            )
            .await;
        assert!(result.ok);
        let stdout = result.stdout.unwrap();
        assert!(stdout.contains("one") && stdout.contains("two"));
    }

    #[tokio::test]
    async fn shell_command_quoted_arguments_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ShellCommandHandler::new(10_000);
        let result = handler
            .execute(
                serde_json::json!({"command": "echo \"hello world\""}),
                &ctx(dir.path()),
            )
            .await;
        assert!(result.ok);
        assert_eq!(result.stdout.as_deref().map(str::trim), Some("hello world"));
    }

    #[tokio::test]
    async fn output_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ShellExecHandler::new(1_000);
        let result = handler
            .execute(
                serde_json::json!({"argv": ["sh", "-c", "yes x | head -c 100000"]}),
                &ctx(dir.path()),
            )
            .await;
        assert!(result.truncated);
        assert!(result.stdout.unwrap().len() <= 1_000);
    }
}
