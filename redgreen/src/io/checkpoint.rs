//! Checkpoint engine: snapshot and restore of an explicit set of files.
//!
//! Restore is intentionally not transactional. Paths are written in order and
//! the first failure stops the restore; earlier paths stay restored. The
//! returned [`RestoreError`] records which paths were written so the caller
//! can decide how to remediate.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::error::RestoreError;
use crate::io::files::FileAccess;

/// Captured file contents keyed by path.
pub type Snapshot = BTreeMap<PathBuf, String>;

/// Read the current content of every existing path.
///
/// Paths that do not exist are omitted; a restore of the snapshot will not
/// recreate them.
#[instrument(skip_all, fields(paths = paths.len()))]
pub fn snapshot<F: FileAccess + ?Sized>(files: &F, paths: &[PathBuf]) -> Result<Snapshot> {
    let mut captured = Snapshot::new();
    for path in paths {
        if captured.contains_key(path) {
            continue;
        }
        match files
            .read(path)
            .with_context(|| format!("snapshot {}", path.display()))?
        {
            Some(contents) => {
                captured.insert(path.clone(), contents);
            }
            None => debug!(path = %path.display(), "skipping missing path"),
        }
    }
    debug!(captured = captured.len(), "snapshot taken");
    Ok(captured)
}

/// Write every captured path back verbatim, in path order.
///
/// Returns the restored paths on success.
#[instrument(skip_all, fields(paths = snapshot.len()))]
pub fn restore<F: FileAccess + ?Sized>(
    files: &F,
    snapshot: &Snapshot,
) -> Result<Vec<PathBuf>, RestoreError> {
    let mut restored = Vec::with_capacity(snapshot.len());
    let mut entries = snapshot.iter();

    while let Some((path, contents)) = entries.next() {
        if let Err(source) = files.write(path, contents) {
            let not_attempted: Vec<PathBuf> = entries.map(|(path, _)| path.clone()).collect();
            warn!(
                path = %path.display(),
                restored = restored.len(),
                not_attempted = not_attempted.len(),
                err = %source,
                "restore stopped partway"
            );
            return Err(RestoreError {
                restored,
                failed_path: path.clone(),
                not_attempted,
                source,
            });
        }
        restored.push(path.clone());
    }

    info!(restored = restored.len(), "snapshot restored");
    Ok(restored)
}
