//! Append-only JSONL event log (WAL) — the durable record of a run.
//!
//! One WAL per run at `<runtime>/runs/<run_id>/events.jsonl`. Single
//! writer per run by construction; readers tolerate a truncated trailing
//! line (crash mid-append) by discarding it.

mod fork;
mod reader;
mod writer;

pub use fork::fork;
pub use reader::{read_prefix, ReadOptions};
pub use writer::{WalLocator, WalWriter};

use std::path::{Path, PathBuf};

/// Resolve the WAL file path for a run under a runtime directory.
pub fn wal_path(runtime_dir: &Path, run_id: &str) -> PathBuf {
    runtime_dir.join("runs").join(run_id).join("events.jsonl")
}

/// Resolve the artifacts directory for a run.
pub fn artifacts_path(runtime_dir: &Path, run_id: &str) -> PathBuf {
    runtime_dir.join("runs").join(run_id).join("artifacts")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_path_layout() {
        let path = wal_path(Path::new("/w/.skills_runtime"), "r1");
        assert_eq!(path, PathBuf::from("/w/.skills_runtime/runs/r1/events.jsonl"));
    }

    #[test]
    fn artifacts_path_layout() {
        let path = artifacts_path(Path::new("/w/.skills_runtime"), "r1");
        assert_eq!(path, PathBuf::from("/w/.skills_runtime/runs/r1/artifacts"));
    }
}
