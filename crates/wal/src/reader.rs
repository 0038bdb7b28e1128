//! Replay side of the WAL: ordered reads with crash tolerance.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use sr_domain::{Error, Event, Result};

/// Options for a prefix read.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Inclusive upper bound on the 0-based line index. `None` reads
    /// the whole file.
    pub until_index: Option<u64>,
}

/// Read events in file order, up to and including `until_index`.
///
/// A truncated trailing line (no `\n`) is discarded silently — it is
/// the residue of a crashed append. A *complete* line that fails to
/// parse is corruption and fails the read.
pub fn read_prefix(runtime_dir: &Path, run_id: &str, options: ReadOptions) -> Result<Vec<Event>> {
    let path = super::wal_path(runtime_dir, run_id);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("no WAL for run {run_id:?}")));
        }
        Err(e) => return Err(e.into()),
    };

    let mut events = Vec::new();
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut index = 0u64;
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        if !line.ends_with('\n') {
            tracing::debug!(run_id, index, "dropping truncated trailing WAL line");
            break;
        }
        let event: Event = serde_json::from_str(line.trim_end()).map_err(|e| {
            Error::Validation(format!("corrupt WAL line {index} for run {run_id:?}: {e}"))
        })?;
        events.push(event);
        if let Some(until) = options.until_index {
            if index >= until {
                break;
            }
        }
        index += 1;
    }
    Ok(events)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
