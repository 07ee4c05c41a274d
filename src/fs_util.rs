//! Filesystem helpers that run in-process rather than through a shell.

use log::{debug, warn};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One entry that could not be removed
#[derive(Debug)]
pub struct DeleteFailure {
    pub path: PathBuf,
    pub error: io::Error,
}

/// Remove `path` (file or directory tree), continuing past entries that fail.
///
/// Children are visited before their parent. A missing `path` is not an error.
/// Every failure is returned; an empty vector means the tree is gone.
pub fn delete_tree(path: &Path) -> Vec<DeleteFailure> {
    let mut failures = Vec::new();
    if path.symlink_metadata().is_err() {
        return failures;
    }

    for entry in WalkDir::new(path).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| path.to_path_buf());
                failures.push(DeleteFailure {
                    path,
                    error: e.into_io_error().unwrap_or_else(|| io::Error::other("walk loop")),
                });
                continue;
            }
        };
        let result = if entry.file_type().is_dir() {
            std::fs::remove_dir(entry.path())
        } else {
            std::fs::remove_file(entry.path())
        };
        if let Err(error) = result {
            failures.push(DeleteFailure {
                path: entry.path().to_path_buf(),
                error,
            });
        }
    }

    if failures.is_empty() {
        debug!("Deleted {:?}", path);
    } else {
        for f in &failures {
            warn!("Failed to delete {:?}: {}", f.path, f.error);
        }
    }
    failures
}

/// Whether `dir` exists and has at least one entry
pub fn has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
