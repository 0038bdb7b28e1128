//! `exec_registry.json` — the orphan-cleanup ledger.
//!
//! Every PTY child the server spawns is recorded here with the
//! workspace marker. After an unclean restart the new server signals
//! any still-alive entries for its own workspace, then truncates the
//! file. Updated on every session create/close.

use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use sr_domain::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryEntry {
    pub pid: u32,
    pub marker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecRegistry {
    pub entries: Vec<RegistryEntry>,
}

impl ExecRegistry {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Atomic write (tmp + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn add(&mut self, pid: u32, marker: &str) {
        self.entries.push(RegistryEntry { pid, marker: marker.to_string() });
    }

    pub fn remove(&mut self, pid: u32) {
        self.entries.retain(|e| e.pid != pid);
    }
}

/// Is the process still alive? (signal 0 probe)
pub fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Terminate still-alive entries belonging to `marker`, then truncate
/// the registry. Returns how many processes were signalled.
pub fn cleanup_orphans(path: &Path, marker: &str) -> usize {
    let registry = ExecRegistry::load(path);
    let mut signalled = 0;
    for entry in &registry.entries {
        if entry.marker != marker {
            continue;
        }
        if pid_alive(entry.pid) {
            tracing::warn!(pid = entry.pid, "terminating orphaned exec child");
            if kill(Pid::from_raw(entry.pid as i32), Signal::SIGTERM).is_ok() {
                signalled += 1;
            }
        }
    }
    let remaining = ExecRegistry {
        entries: registry.entries.into_iter().filter(|e| e.marker != marker).collect(),
    };
    if let Err(e) = remaining.save(path) {
        tracing::warn!(error = %e, "failed to truncate exec registry");
    }
    signalled
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
