//! On-disk layout of the runtime server's state.

use std::path::{Path, PathBuf};

/// Paths under `<workspace>/<runtime-dir>/runtime/`.
#[derive(Debug, Clone)]
pub struct ServerPaths {
    runtime_root: PathBuf,
}

impl ServerPaths {
    /// `runtime_dir` is the workspace runtime directory, e.g.
    /// `<workspace>/.skills_runtime`.
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self { runtime_root: runtime_dir.into().join("runtime") }
    }

    pub fn root(&self) -> &Path {
        &self.runtime_root
    }

    pub fn socket(&self) -> PathBuf {
        self.runtime_root.join("runtime.sock")
    }

    pub fn server_json(&self) -> PathBuf {
        self.runtime_root.join("server.json")
    }

    pub fn exec_registry(&self) -> PathBuf {
        self.runtime_root.join("exec_registry.json")
    }

    pub fn stdout_log(&self) -> PathBuf {
        self.runtime_root.join("server.stdout.log")
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.runtime_root.join("server.stderr.log")
    }

    /// The marker identifying this workspace in the orphan registry.
    pub fn workspace_marker(&self) -> String {
        self.runtime_root.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let paths = ServerPaths::new("/w/.skills_runtime");
        assert_eq!(paths.socket(), PathBuf::from("/w/.skills_runtime/runtime/runtime.sock"));
        assert_eq!(paths.server_json(), PathBuf::from("/w/.skills_runtime/runtime/server.json"));
        assert_eq!(
            paths.exec_registry(),
            PathBuf::from("/w/.skills_runtime/runtime/exec_registry.json")
        );
    }
}
