//! Best-effort removal of scratch files recorded in a ledger.

use std::fs;
use std::io;
use std::path::Path;

use seqpipe_types::ledger::FileLedger;
use tracing::{debug, info, warn};

/// Delete the ledger's intermediate files. Directories are removed
/// recursively; files that are retained outputs are left alone. Returns the
/// number of paths removed.
pub fn delete_intermediate_files(ledger: &FileLedger) -> usize {
    let removed = ledger
        .intermediate_files()
        .iter()
        .filter(|file| !ledger.is_retained(file))
        .filter(|file| remove_logged(file))
        .count();
    if removed > 0 {
        info!(removed, "Deleted intermediate files");
    }
    removed
}

/// Delete files whose removal was deferred past intermediate cleanup.
pub fn delete_deferred_files(ledger: &FileLedger) -> usize {
    let removed = ledger
        .deferred_delete_files()
        .iter()
        .filter(|file| remove_logged(file))
        .count();
    if removed > 0 {
        info!(removed, "Deleted deferred files");
    }
    removed
}

fn remove_logged(path: &Path) -> bool {
    match remove_path(path) {
        Ok(true) => {
            debug!(file = %path.display(), "Deleted");
            true
        }
        Ok(false) => false,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Failed to delete file");
            false
        }
    }
}

fn remove_path(path: &Path) -> io::Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}
