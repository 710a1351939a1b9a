//! Filesystem operations module.
//!
//! This module provides the local filesystem helpers the engines need:
//! - Enumerating directory trees (verification, size estimates)
//! - Free space queries for the pre-deletion guard
//! - Removing empty directory trees after deletion
//! - Locating external binaries for the preflight check

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::error::EngineError;

/// One file or directory found under a root.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeEntry {
    /// Path relative to the enumerated root
    pub relative: PathBuf,
    /// File size in bytes (0 for directories)
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<FileTime>,
}

/// Whether a location names a remote endpoint rather than a local path.
///
/// Matches `host:path`, `user@host:path`, `remote:bucket/key` and
/// `rsync://...`. Single-letter prefixes are Windows drive letters.
pub fn is_remote(location: &str) -> bool {
    if location.starts_with("rsync://") {
        return true;
    }
    match location.find(':') {
        Some(colon) => {
            let prefix = &location[..colon];
            colon > 1 && !prefix.contains('/') && !prefix.contains('\\')
        }
        None => false,
    }
}

/// Enumerate the tree under `root`, returning every file and subdirectory.
///
/// Symlinks are reported but not followed. Entries are sorted by relative
/// path so callers get a stable order.
pub fn enumerate_tree(root: &Path) -> Result<Vec<TreeEntry>, EngineError> {
    fn recurse(dir: &Path, rel: &Path, items: &mut Vec<TreeEntry>) -> Result<(), EngineError> {
        let entries = fs::read_dir(dir).map_err(|source| EngineError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| EngineError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let metadata = entry.path().symlink_metadata().map_err(|source| EngineError::Io {
                path: entry.path(),
                source,
            })?;
            let relative = rel.join(entry.file_name());

            if metadata.is_dir() {
                items.push(TreeEntry {
                    relative: relative.clone(),
                    size: 0,
                    is_dir: true,
                    modified: Some(FileTime::from_last_modification_time(&metadata)),
                });
                recurse(&entry.path(), &relative, items)?;
            } else {
                items.push(TreeEntry {
                    relative,
                    size: metadata.len(),
                    is_dir: false,
                    modified: Some(FileTime::from_last_modification_time(&metadata)),
                });
            }
        }
        Ok(())
    }

    let mut items = Vec::new();
    recurse(root, Path::new(""), &mut items)?;
    items.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(items)
}

/// Total size of the regular files under `root` (or of `root` itself if it is a file).
pub fn tree_size(root: &Path) -> Result<u64, EngineError> {
    let metadata = fs::metadata(root).map_err(|source| EngineError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    Ok(enumerate_tree(root)?
        .iter()
        .filter(|e| !e.is_dir)
        .map(|e| e.size)
        .sum())
}

/// Bytes available to unprivileged users on the filesystem holding `path`.
///
/// Walks up to the nearest existing ancestor so a destination that has not
/// been created yet can still be checked.
#[cfg(unix)]
pub fn available_space(path: &Path) -> Result<u64, EngineError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let existing = path
        .ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or_else(|| Path::new("."));

    let c_path = CString::new(existing.as_os_str().as_bytes()).map_err(|e| EngineError::Io {
        path: existing.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(EngineError::Io {
            path: existing.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn available_space(path: &Path) -> Result<u64, EngineError> {
    Err(EngineError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::Unsupported, "free space query not supported"),
    })
}

/// Remove every empty directory below `root`, deepest first.
///
/// `root` itself is kept. Returns the number of directories removed.
pub fn remove_empty_dirs(root: &Path) -> Result<usize, EngineError> {
    fn prune(dir: &Path) -> Result<(usize, bool), EngineError> {
        let mut removed = 0;
        let mut empty = true;
        let entries = fs::read_dir(dir).map_err(|source| EngineError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| EngineError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let is_dir = path.symlink_metadata().map(|m| m.is_dir()).unwrap_or(false);
            if !is_dir {
                empty = false;
                continue;
            }
            let (child_removed, child_empty) = prune(&path)?;
            removed += child_removed;
            if child_empty {
                fs::remove_dir(&path).map_err(|source| EngineError::Io {
                    path: path.clone(),
                    source,
                })?;
                removed += 1;
            } else {
                empty = false;
            }
        }
        Ok((removed, empty))
    }

    if !root.is_dir() {
        return Ok(0);
    }
    prune(root).map(|(removed, _)| removed)
}

/// Resolve a configured binary to an executable path.
///
/// Paths with a directory component are checked as given; bare names are
/// searched on `PATH`.
pub fn find_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 {
        return is_executable(binary).then(|| binary.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_remote() {
        assert!(is_remote("backup@nas:/volume1/photos"));
        assert!(is_remote("nas:photos"));
        assert!(is_remote("s3remote:bucket/path"));
        assert!(is_remote("rsync://mirror.example.org/pub"));

        assert!(!is_remote("/home/user/photos"));
        assert!(!is_remote("relative/dir"));
        assert!(!is_remote("./weird:name"));
        assert!(!is_remote("C:\\Users\\photos"));
    }

    #[test]
    fn test_enumerate_nested_directory() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();
        fs::create_dir(src.join("subdir")).expect("Failed to create subdir");
        fs::write(src.join("file1.txt"), b"data1").expect("Failed to write file1");
        fs::write(src.join("subdir").join("file2.txt"), b"data22").expect("Failed to write file2");

        let items = enumerate_tree(src).expect("Failed to enumerate");

        let dirs: Vec<_> = items.iter().filter(|f| f.is_dir).collect();
        let files: Vec<_> = items.iter().filter(|f| !f.is_dir).collect();
        assert_eq!(dirs.len(), 1);
        assert_eq!(files.len(), 2);
        assert!(items.iter().any(|e| e.relative == Path::new("subdir/file2.txt")));
        assert_eq!(tree_size(src).expect("size"), 11);
    }

    #[test]
    fn test_enumerate_nonexistent_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        assert!(enumerate_tree(&temp_dir.path().join("nonexistent")).is_err());
    }

    #[test]
    fn test_remove_empty_dirs_keeps_root_and_files() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        fs::create_dir_all(root.join("a/b/c")).expect("mkdir");
        fs::create_dir_all(root.join("keep")).expect("mkdir");
        fs::write(root.join("keep/file.txt"), b"x").expect("write");

        let removed = remove_empty_dirs(root).expect("prune");
        assert_eq!(removed, 3);
        assert!(root.exists());
        assert!(!root.join("a").exists());
        assert!(root.join("keep/file.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_available_space_of_missing_child() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let space = available_space(&temp_dir.path().join("not/yet/created")).expect("statvfs");
        assert!(space > 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_find_binary() {
        assert!(find_binary(Path::new("sh")).is_some());
        assert!(find_binary(Path::new("definitely-not-a-real-binary-xyz")).is_none());
        assert!(find_binary(Path::new("/nonexistent/dir/rsync")).is_none());
    }
}
