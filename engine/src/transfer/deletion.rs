//! Source deletion safety.
//!
//! - Free-space guard run before any transfer that can delete
//! - In-process removal of the verified files of a local source
//! - File lists handing the verified files to rsync or rclone
//! - Helpers for cleaning empty directories on remote sources

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::verify::VerifiedFile;
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::Job;

/// Outcome of the pre-deletion free-space guard.
#[derive(Debug, Clone, PartialEq)]
pub enum SpaceCheck {
    Sufficient { needed: u64, available: u64 },
    /// The check could not be made; the transfer proceeds with a warning
    Skipped(String),
}

/// Space required for `source_size` bytes plus the safety margin.
pub fn required_space(source_size: u64, margin: f64) -> u64 {
    (source_size as f64 * (1.0 + margin.max(0.0))).ceil() as u64
}

/// Refuse to start a deleting transfer that might not fit at the destination.
pub fn check_free_space(job: &Job, margin: f64) -> Result<SpaceCheck, EngineError> {
    if fs_ops::is_remote(&job.dest) {
        return Ok(SpaceCheck::Skipped(format!(
            "destination {} is remote; free space cannot be checked",
            job.dest
        )));
    }
    if fs_ops::is_remote(&job.source) {
        return Ok(SpaceCheck::Skipped(format!(
            "source {} is remote; its size cannot be estimated",
            job.source
        )));
    }

    let dest = Path::new(&job.dest);
    let needed = required_space(fs_ops::tree_size(Path::new(&job.source))?, margin);
    let available = fs_ops::available_space(dest)?;
    if available < needed {
        return Err(EngineError::InsufficientSpace {
            path: dest.to_path_buf(),
            needed,
            available,
        });
    }
    Ok(SpaceCheck::Sufficient { needed, available })
}

/// What a local source deletion removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Removal {
    pub files: u64,
    pub bytes: u64,
    /// Verified files that changed afterwards and were left in place
    pub kept: Vec<PathBuf>,
}

/// Remove the verified files of a local source, nothing else.
///
/// A file whose size or mtime moved since verification is kept, and files
/// that have already gone are skipped. Directories are left for the cleanup
/// step. Returns `None` if stopped.
pub fn delete_local_source(
    source: &Path,
    verified: &[VerifiedFile],
    should_stop: &dyn Fn() -> bool,
) -> Result<Option<Removal>, EngineError> {
    let mut removal = Removal::default();
    for file in verified {
        if should_stop() {
            return Ok(None);
        }
        let path = file.path_under(source);
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(EngineError::Io { path, source: e }),
        };
        if !file.unchanged(&metadata) {
            removal.kept.push(file.relative.clone());
            continue;
        }
        fs::remove_file(&path).map_err(|e| EngineError::Io {
            path: path.clone(),
            source: e,
        })?;
        removal.files += 1;
        removal.bytes += metadata.len();
    }
    Ok(Some(removal))
}

/// Write the relative paths of `files` to a temporary file, each followed
/// by `separator`. The file is removed when the handle drops.
pub fn write_file_list(files: &[VerifiedFile], separator: u8) -> Result<NamedTempFile, EngineError> {
    let write = || -> io::Result<NamedTempFile> {
        let mut list = tempfile::Builder::new().prefix("shuttle-files-").tempfile()?;
        for file in files {
            list.write_all(file.relative.to_string_lossy().as_bytes())?;
            list.write_all(&[separator])?;
        }
        list.flush()?;
        Ok(list)
    };
    write().map_err(|e| EngineError::Io {
        path: std::env::temp_dir(),
        source: e,
    })
}

/// Split an ssh-style `[user@]host:path` location.
///
/// Daemon locations (`rsync://`, `host::module`) have no shell access and
/// return `None`.
pub fn split_ssh_location(location: &str) -> Option<(&str, &str)> {
    if location.starts_with("rsync://") {
        return None;
    }
    let (host, path) = location.split_once(':')?;
    if host.is_empty() || path.starts_with(':') {
        return None;
    }
    Some((host, if path.is_empty() { "." } else { path }))
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
