//! Forking a run: copy a WAL prefix under a new run id.

use std::path::Path;

use sr_domain::{Error, Result};

use crate::reader::{read_prefix, ReadOptions};
use crate::writer::{WalLocator, WalWriter};

/// Copy the events of `src_run_id` up to and including
/// `fork_point_index` into a brand-new WAL under `new_run_id`,
/// rewriting the embedded `run_id` on every copied event.
///
/// The new run must not already have a WAL.
pub fn fork(
    runtime_dir: &Path,
    src_run_id: &str,
    fork_point_index: u64,
    new_run_id: &str,
) -> Result<WalLocator> {
    if src_run_id == new_run_id {
        return Err(Error::Validation("fork target must be a new run id".into()));
    }
    let new_path = crate::wal_path(runtime_dir, new_run_id);
    if new_path.exists() {
        return Err(Error::Validation(format!(
            "run {new_run_id:?} already has a WAL"
        )));
    }

    let events = read_prefix(
        runtime_dir,
        src_run_id,
        ReadOptions { until_index: Some(fork_point_index) },
    )?;

    let mut writer = WalWriter::open(runtime_dir, new_run_id)?;
    for mut event in events {
        event.run_id = new_run_id.to_string();
        writer.append(&event)?;
    }

    tracing::info!(
        src = src_run_id,
        fork_point = fork_point_index,
        new = new_run_id,
        copied = writer.next_index(),
        "forked WAL"
    );
    Ok(writer.locator().clone())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
