//! Per-call execution context handed to tool handlers.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use sr_domain::{Error, Result};

use crate::sandbox::SandboxAdapter;

/// Everything a handler may touch during one tool call.
///
/// Path arguments MUST resolve under `workspace_root`; the effective
/// environment is `session_env ⊕ per_call_env` with per-call keys (not
/// values) echoed into audit events.
pub struct ToolExecutionContext {
    pub workspace_root: PathBuf,
    session_env: HashMap<String, String>,
    per_call_env: HashMap<String, String>,
    /// Present iff `restricted` is effective and an adapter was acquired.
    pub sandbox: Option<Arc<dyn SandboxAdapter>>,
    /// Per-tool timeout the dispatcher enforces; handlers that manage
    /// their own children should honor it too.
    pub timeout_ms: u64,
}

impl ToolExecutionContext {
    pub fn new(workspace_root: impl Into<PathBuf>, timeout_ms: u64) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            session_env: HashMap::new(),
            per_call_env: HashMap::new(),
            sandbox: None,
            timeout_ms,
        }
    }

    pub fn with_session_env(mut self, env: HashMap<String, String>) -> Self {
        self.session_env = env;
        self
    }

    pub fn with_per_call_env(mut self, env: HashMap<String, String>) -> Self {
        self.per_call_env = env;
        self
    }

    pub fn with_sandbox(mut self, adapter: Arc<dyn SandboxAdapter>) -> Self {
        self.sandbox = Some(adapter);
        self
    }

    /// Merged environment: per-call keys override session keys.
    pub fn env(&self) -> HashMap<String, String> {
        let mut merged = self.session_env.clone();
        merged.extend(self.per_call_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Per-call env var *names*, sorted — safe to put in events.
    pub fn per_call_env_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.per_call_env.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Resolve a path argument under the workspace root.
    ///
    /// Rejects absolute paths outside the root and any traversal that
    /// escapes it. Works on non-existent targets (no canonicalize), so
    /// `file_write` can create new files.
    pub fn resolve_path(&self, raw: &str) -> Result<PathBuf> {
        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace_root.join(candidate)
        };

        let normalized = normalize(&joined);
        let root = normalize(&self.workspace_root);
        if !normalized.starts_with(&root) {
            return Err(Error::Permission(format!(
                "path {raw:?} escapes the workspace root"
            )));
        }
        Ok(normalized)
    }
}

/// Lexically normalize `.` and `..` components without touching the
/// filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(root: &str) -> ToolExecutionContext {
        ToolExecutionContext::new(root, 1_000)
    }

    #[test]
    fn relative_path_resolves_under_root() {
        let ctx = ctx("/work/space");
        assert_eq!(ctx.resolve_path("out/result.txt").unwrap(), PathBuf::from("/work/space/out/result.txt"));
    }

    #[test]
    fn absolute_path_inside_root_accepted() {
        let ctx = ctx("/work/space");
        assert!(ctx.resolve_path("/work/space/a.txt").is_ok());
    }

    #[test]
    fn traversal_escape_rejected() {
        let ctx = ctx("/work/space");
        let err = ctx.resolve_path("../outside.txt").unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::Permission);
        assert!(ctx.resolve_path("a/../../b").is_err());
    }

    #[test]
    fn absolute_escape_rejected() {
        let ctx = ctx("/work/space");
        let err = ctx.resolve_path("/etc/passwd").unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::Permission);
    }

    #[test]
    fn dot_components_collapse() {
        let ctx = ctx("/work/space");
        assert_eq!(
            ctx.resolve_path("./a/./b/../c.txt").unwrap(),
            PathBuf::from("/work/space/a/c.txt")
        );
    }

    #[test]
    fn nonexistent_target_still_resolves() {
        let ctx = ctx("/work/space");
        assert!(ctx.resolve_path("brand/new/file.txt").is_ok());
    }

    #[test]
    fn env_merge_per_call_wins() {
        let session: HashMap<_, _> =
            [("SHARED".to_string(), "session".to_string()), ("ONLY_S".to_string(), "s".to_string())]
                .into();
        let per_call: HashMap<_, _> =
            [("SHARED".to_string(), "call".to_string()), ("ONLY_C".to_string(), "c".to_string())]
                .into();
        let ctx = ctx("/w").with_session_env(session).with_per_call_env(per_call);

        let merged = ctx.env();
        assert_eq!(merged["SHARED"], "call");
        assert_eq!(merged["ONLY_S"], "s");
        assert_eq!(merged["ONLY_C"], "c");
        assert_eq!(ctx.per_call_env_keys(), vec!["ONLY_C", "SHARED"]);
    }
}
