//! Verification pass comparing a source tree with its destination copy.
//!
//! Local-to-local jobs are verified in-process. Jobs with a remote end use
//! the tool's own comparison; those parsers live with each tool.

use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::checksums::{self, ChecksumAlgorithm};
use crate::error::EngineError;
use crate::fs_ops::{self, TreeEntry};
use crate::model::{VerificationMode, VerificationProgress};

/// Mismatched paths kept for the report.
const MAX_LISTED: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMethod {
    SizeAndMtime,
    Checksum(ChecksumAlgorithm),
}

impl VerifyMethod {
    pub fn for_mode(mode: VerificationMode, algorithm: ChecksumAlgorithm) -> Self {
        match mode {
            VerificationMode::Fast => VerifyMethod::SizeAndMtime,
            VerificationMode::Checksum | VerificationMode::VerifyAfter => VerifyMethod::Checksum(algorithm),
        }
    }

    pub fn uses_checksum(&self) -> bool {
        matches!(self, VerifyMethod::Checksum(_))
    }
}

/// A source file that matched its copy, with the state it was verified in.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedFile {
    /// Relative to the source; empty when the source is a single file
    pub relative: PathBuf,
    pub size: u64,
    /// `None` when the comparison ran remotely and reported names only
    pub modified: Option<FileTime>,
}

impl VerifiedFile {
    pub fn named(relative: impl Into<PathBuf>) -> Self {
        VerifiedFile {
            relative: relative.into(),
            size: 0,
            modified: None,
        }
    }

    fn from_entry(entry: &TreeEntry) -> Self {
        VerifiedFile {
            relative: entry.relative.clone(),
            size: entry.size,
            modified: entry.modified,
        }
    }

    pub fn path_under(&self, root: &Path) -> PathBuf {
        if self.relative.as_os_str().is_empty() {
            root.to_path_buf()
        } else {
            root.join(&self.relative)
        }
    }

    /// Whether `metadata` (from `symlink_metadata`) still describes the
    /// file as it was verified.
    pub fn unchanged(&self, metadata: &Metadata) -> bool {
        !metadata.is_dir()
            && metadata.len() == self.size
            && self.modified == Some(FileTime::from_last_modification_time(metadata))
    }
}

/// Outcome of a verification pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyReport {
    pub files_checked: u64,
    pub mismatches: u64,
    /// First few mismatched paths, relative to the source
    pub mismatched: Vec<String>,
    /// Every file that matched; only these may be removed from the source
    pub verified: Vec<VerifiedFile>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }

    pub fn record_match(&mut self, file: VerifiedFile) {
        self.files_checked += 1;
        self.verified.push(file);
    }

    pub fn record_miss(&mut self, name: impl Into<String>) {
        self.files_checked += 1;
        self.record_mismatch(name);
    }

    pub fn record_mismatch(&mut self, name: impl Into<String>) {
        self.mismatches += 1;
        if self.mismatched.len() < MAX_LISTED {
            self.mismatched.push(name.into());
        }
    }

    pub fn apply_to(&self, progress: &mut VerificationProgress) {
        progress.passed = Some(self.passed());
        progress.files_checked = self.files_checked;
        progress.mismatches = self.mismatches;
    }

    pub fn summary(&self) -> String {
        if self.passed() {
            return format!("verified {} files", self.files_checked);
        }
        let mut summary = format!(
            "verification found {} mismatched of {} files",
            self.mismatches, self.files_checked
        );
        if !self.mismatched.is_empty() {
            summary.push_str(": ");
            summary.push_str(&self.mismatched.join(", "));
        }
        summary
    }
}

/// Compare every file under `source` with its counterpart under `dest`.
///
/// A file source is compared with `dest` itself, or with `dest/<name>` when
/// `dest` is a directory. Returns `None` when `should_stop` interrupts the pass.
pub fn verify_local(
    source: &Path,
    dest: &Path,
    method: VerifyMethod,
    should_stop: &dyn Fn() -> bool,
) -> Result<Option<VerifyReport>, EngineError> {
    let mut report = VerifyReport::default();

    let metadata = fs::metadata(source).map_err(|e| EngineError::Io {
        path: source.to_path_buf(),
        source: e,
    })?;
    if metadata.is_file() {
        let target = match source.file_name() {
            Some(name) if dest.is_dir() => dest.join(name),
            _ => dest.to_path_buf(),
        };
        if file_matches(source, &target, method)? {
            report.record_match(VerifiedFile {
                relative: PathBuf::new(),
                size: metadata.len(),
                modified: Some(FileTime::from_last_modification_time(&metadata)),
            });
        } else {
            report.record_miss(source.to_string_lossy());
        }
        return Ok(Some(report));
    }

    for entry in fs_ops::enumerate_tree(source)? {
        if entry.is_dir {
            continue;
        }
        if should_stop() {
            return Ok(None);
        }
        if file_matches(&source.join(&entry.relative), &dest.join(&entry.relative), method)? {
            report.record_match(VerifiedFile::from_entry(&entry));
        } else {
            report.record_miss(entry.relative.to_string_lossy());
        }
    }
    Ok(Some(report))
}

/// Symlinks are compared by target and never followed.
fn file_matches(source: &Path, dest: &Path, method: VerifyMethod) -> Result<bool, EngineError> {
    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| EngineError::Io { path, source }
    };
    let src_meta = fs::symlink_metadata(source).map_err(io_error(source))?;
    let dst_meta = match fs::symlink_metadata(dest) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(io_error(dest)(e)),
    };

    if src_meta.file_type().is_symlink() {
        if !dst_meta.file_type().is_symlink() {
            return Ok(false);
        }
        let target = fs::read_link(source).map_err(io_error(source))?;
        return Ok(fs::read_link(dest).map_or(false, |copied| copied == target));
    }
    if !dst_meta.is_file() || src_meta.len() != dst_meta.len() {
        return Ok(false);
    }

    match method {
        VerifyMethod::SizeAndMtime => {
            // Whole seconds: not every filesystem keeps nanoseconds
            let src_mtime = FileTime::from_last_modification_time(&src_meta);
            let dst_mtime = FileTime::from_last_modification_time(&dst_meta);
            Ok(src_mtime.unix_seconds() == dst_mtime.unix_seconds())
        }
        VerifyMethod::Checksum(algorithm) => checksums::files_match(source, dest, algorithm),
    }
}
