//! Archive collaborator.
//!
//! Pipelines only talk to the [`Archiver`] trait. `ZipArchiver` stores a
//! directory `<parent>/<name>` as `<parent>/<name>.zip` with every entry
//! prefixed by `<name>/`, so extracting into `<parent>` recreates the tree.

use log::{debug, info, warn};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{PkgVaultError, Result};
use crate::error_sink::ErrorSink;
use crate::fs_util::delete_tree;
use crate::types::archive_path;

/// Outcome of compressing one directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveStatus {
    Success,
    /// The directory held nothing; an empty placeholder archive may have been written
    Empty,
    Failure(String),
}

pub trait Archiver: Send + Sync {
    /// Write `<dir>.zip` from `dir`
    fn compress(&self, dir: &Path) -> ArchiveStatus;

    /// Extract `archive` into `dest`, optionally only the named entries
    fn decompress(&self, archive: &Path, dest: &Path, entries: Option<&[String]>) -> Result<()>;

    /// Entry names starting with `prefix`, in archive order
    fn list(&self, archive: &Path, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ZipArchiver;

fn zip_err(e: zip::result::ZipError) -> PkgVaultError {
    PkgVaultError::archive(e.to_string())
}

impl ZipArchiver {
    fn write_archive(&self, dir: &Path, archive: &Path) -> Result<usize> {
        let base = dir
            .file_name()
            .ok_or_else(|| PkgVaultError::archive(format!("{:?} has no name", dir)))?
            .to_string_lossy()
            .to_string();
        let mut zip = ZipWriter::new(File::create(archive)?);
        let mut added = 0;

        for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| PkgVaultError::archive(e.to_string()))?;
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| PkgVaultError::archive(e.to_string()))?;
            let name = format!("{}/{}", base, rel.to_string_lossy());
            let mode = unix_mode(&entry.metadata().map_err(|e| PkgVaultError::archive(e.to_string()))?);
            let options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(mode);

            if entry.file_type().is_dir() {
                zip.add_directory(name, options).map_err(zip_err)?;
            } else if entry.file_type().is_file() {
                zip.start_file(name, options).map_err(zip_err)?;
                io::copy(&mut File::open(entry.path())?, &mut zip)?;
            } else {
                debug!("Skipping non-regular entry {:?}", entry.path());
                continue;
            }
            added += 1;
        }
        zip.finish().map_err(zip_err)?;
        Ok(added)
    }
}

fn unix_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

impl Archiver for ZipArchiver {
    fn compress(&self, dir: &Path) -> ArchiveStatus {
        if !dir.is_dir() {
            return ArchiveStatus::Failure(format!("{:?} is not a directory", dir));
        }
        let archive = archive_path(dir);
        match self.write_archive(dir, &archive) {
            Ok(0) => ArchiveStatus::Empty,
            Ok(n) => {
                info!("Archived {} entries of {:?}", n, dir);
                ArchiveStatus::Success
            }
            Err(e) => {
                let _ = fs::remove_file(&archive);
                ArchiveStatus::Failure(e.to_string())
            }
        }
    }

    fn decompress(&self, archive: &Path, dest: &Path, entries: Option<&[String]>) -> Result<()> {
        let mut zip = ZipArchive::new(File::open(archive)?).map_err(zip_err)?;
        fs::create_dir_all(dest)?;

        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).map_err(zip_err)?;
            if let Some(wanted) = entries {
                if !wanted.iter().any(|w| w == entry.name()) {
                    continue;
                }
            }
            let Some(rel) = entry.enclosed_name() else {
                warn!("Skipping unsafe archive entry {:?}", entry.name());
                continue;
            };
            let out = dest.join(rel);
            if entry.is_dir() {
                fs::create_dir_all(&out)?;
            } else {
                if let Some(parent) = out.parent() {
                    fs::create_dir_all(parent)?;
                }
                io::copy(&mut entry, &mut File::create(&out)?)?;
                if let Some(mode) = entry.unix_mode() {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&out, fs::Permissions::from_mode(mode & 0o7777))?;
                }
            }
        }
        Ok(())
    }

    fn list(&self, archive: &Path, prefix: &str) -> Result<Vec<String>> {
        let zip = ZipArchive::new(File::open(archive)?).map_err(zip_err)?;
        Ok(zip
            .file_names()
            .filter(|n| n.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }
}

/// Compress `dir` and tidy up after it.
///
/// - success: the uncompressed tree is deleted
/// - empty: the placeholder archive is deleted, still counted as success
/// - failure: reported under `subject`, the tree is kept
///
/// Returns 0 or 1 failures.
pub fn compress_and_clean(
    archiver: &dyn Archiver,
    dir: &Path,
    sink: &ErrorSink,
    subject: &str,
) -> u32 {
    match archiver.compress(dir) {
        ArchiveStatus::Success => {
            for f in delete_tree(dir) {
                sink.report(subject, &format!("could not delete {:?}: {}", f.path, f.error));
            }
            0
        }
        ArchiveStatus::Empty => {
            debug!("Nothing to archive in {:?}", dir);
            delete_tree(&archive_path(dir));
            0
        }
        ArchiveStatus::Failure(reason) => {
            sink.report(subject, &format!("error compressing {:?}: {}", dir, reason));
            1
        }
    }
}
