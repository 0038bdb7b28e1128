//! The single-writer append side of the WAL.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use sr_domain::{Error, Event, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WalLocator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a run's WAL lives. Terminal event payloads carry this so an
/// observer can find the durable record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalLocator {
    pub run_id: String,
    pub path: PathBuf,
}

impl WalLocator {
    /// String form for event payloads (a filesystem path today; an
    /// opaque URI when a non-file backend is in use).
    pub fn as_uri(&self) -> String {
        self.path.display().to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WalWriter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Appends events to one run's JSONL file, returning 0-based line
/// indexes. Append failures are fatal for the run.
pub struct WalWriter {
    locator: WalLocator,
    file: File,
    next_index: u64,
}

impl WalWriter {
    /// Create or resume the WAL for `run_id` under `runtime_dir`.
    ///
    /// Resuming counts existing complete lines so indexes continue
    /// where the previous writer stopped; a truncated trailing line is
    /// not counted (the next append overwrites nothing — JSONL appends
    /// are line-granular, so the partial line is simply superseded on
    /// the reader side).
    pub fn open(runtime_dir: &Path, run_id: &str) -> Result<Self> {
        let path = super::wal_path(runtime_dir, run_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let next_index = count_complete_lines(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            locator: WalLocator { run_id: run_id.to_string(), path },
            file,
            next_index,
        })
    }

    pub fn locator(&self) -> &WalLocator {
        &self.locator
    }

    /// Append one event, flush, and return its 0-based line index.
    pub fn append(&mut self, event: &Event) -> Result<u64> {
        if event.run_id != self.locator.run_id {
            return Err(Error::Validation(format!(
                "event run_id {:?} does not match WAL run {:?}",
                event.run_id, self.locator.run_id
            )));
        }
        let json = serde_json::to_string(event)?;
        self.file.write_all(json.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;

        let index = self.next_index;
        self.next_index += 1;
        Ok(index)
    }

    /// Index the next append would receive (== number of events so far).
    pub fn next_index(&self) -> u64 {
        self.next_index
    }
}

/// Count lines that end in `\n`; a trailing partial line is ignored.
fn count_complete_lines(path: &Path) -> Result<u64> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut count = 0u64;
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        if line.ends_with(b"\n") {
            count += 1;
        }
    }
    Ok(count)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use sr_domain::EventKind;

    fn event(run_id: &str, kind: EventKind) -> Event {
        Event::now(kind, run_id, serde_json::json!({}))
    }

    #[test]
    fn append_returns_sequential_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WalWriter::open(dir.path(), "r1").unwrap();

        assert_eq!(wal.append(&event("r1", EventKind::RunStarted)).unwrap(), 0);
        assert_eq!(wal.append(&event("r1", EventKind::PromptCompiled)).unwrap(), 1);
        assert_eq!(wal.append(&event("r1", EventKind::RunCompleted)).unwrap(), 2);
        assert_eq!(wal.next_index(), 3);
    }

    #[test]
    fn reopen_continues_indexing() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = WalWriter::open(dir.path(), "r1").unwrap();
            wal.append(&event("r1", EventKind::RunStarted)).unwrap();
            wal.append(&event("r1", EventKind::PromptCompiled)).unwrap();
        }
        let mut wal = WalWriter::open(dir.path(), "r1").unwrap();
        assert_eq!(wal.next_index(), 2);
        assert_eq!(wal.append(&event("r1", EventKind::RunCompleted)).unwrap(), 2);
    }

    #[test]
    fn truncated_trailing_line_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = WalWriter::open(dir.path(), "r1").unwrap();
            wal.append(&event("r1", EventKind::RunStarted)).unwrap();
        }
        // Simulate a crash mid-append.
        let path = crate::wal_path(dir.path(), "r1");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"type\":\"prompt_comp").unwrap();
        drop(file);

        let wal = WalWriter::open(dir.path(), "r1").unwrap();
        assert_eq!(wal.next_index(), 1);
    }

    #[test]
    fn rejects_mismatched_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WalWriter::open(dir.path(), "r1").unwrap();
        let err = wal.append(&event("other", EventKind::RunStarted)).unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::Validation);
    }

    #[test]
    fn locator_points_at_file() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WalWriter::open(dir.path(), "r9").unwrap();
        assert!(wal.locator().as_uri().ends_with("runs/r9/events.jsonl"));
        assert_eq!(wal.locator().run_id, "r9");
    }
}
