//! Error types for the orchestration engine.
//!
//! Each layer has its own error enum:
//! - `JobError`: returned by the `JobManager` API, the only errors callers see
//! - `StorageError`: persistence failures (I/O, corruption, writer state)
//! - `EngineError`: supervision of an external transfer process
//!
//! Transient classes (`StorageError::is_transient`) are retried inside the
//! component that owns them and only surface once retries are exhausted.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::{JobId, JobStatus};

/// Errors surfaced by `JobManager` operations.
#[derive(Debug, Error)]
pub enum JobError {
    /// Bad job configuration; nothing was created
    #[error("invalid job configuration: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {id} cannot be started from state '{status}'")]
    NotStartable { id: JobId, status: JobStatus },

    /// A live engine already exists for the job id
    #[error("job {0} already has a live transfer engine")]
    AlreadyRunning(JobId),

    /// Preflight check: the transfer tool is not installed or not on PATH
    #[error("{binary} not found: {hint}")]
    BinaryMissing { binary: String, hint: String },

    /// Optimistic version check failed; re-read the job and retry
    #[error("job {id} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict { id: JobId, expected: u64, actual: u64 },

    #[error("job {id} cannot be {action} while {status}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        action: &'static str,
    },

    #[error("job {id} could not be stopped: {source}")]
    JobNotStoppable {
        id: JobId,
        #[source]
        source: EngineError,
    },

    #[error("failed to launch transfer for job {id}: {source}")]
    Launch {
        id: JobId,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl JobError {
    /// True when the caller may re-read state and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Conflict { .. } => true,
            JobError::Storage(e) => e.is_transient() || matches!(e, StorageError::Unavailable),
            _ => false,
        }
    }
}

/// Errors from the job store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not encode job store: {0}")]
    Encode(#[from] serde_json::Error),

    /// Both the primary document and its backup failed validation
    #[error("job store {path} is corrupt ({reason}) and its backup is unusable ({backup_reason})")]
    Corrupt {
        path: PathBuf,
        reason: String,
        backup_reason: String,
    },

    /// Circuit breaker is open after repeated write failures
    #[error("job store is temporarily unavailable after repeated write failures")]
    Unavailable,

    #[error("job store writer has shut down")]
    WriterGone,

    #[error("refusing stale snapshot: job {id} version {incoming} is older than persisted {persisted}")]
    StaleVersion {
        id: JobId,
        incoming: u64,
        persisted: u64,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Io { source, .. } => is_transient_io(source),
            _ => false,
        }
    }
}

/// Classify an I/O error as temporary (lock contention, interrupted calls).
pub fn is_transient_io(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    matches!(err.raw_os_error(), Some(code) if code == libc::EAGAIN || code == libc::EBUSY)
}

/// Errors from supervising an external transfer process.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("engine was already started")]
    AlreadyStarted,

    #[error("process {pid} did not exit after being killed")]
    NotStoppable { pid: u32 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("insufficient free space at {path}: need {needed} bytes, {available} available")]
    InsufficientSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    /// The tool exited unsuccessfully with a non-retryable error
    #[error("{0}")]
    Process(String),

    #[error("verification could not run: {0}")]
    Verification(String),
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Spawn { source, .. } | Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_io_classification() {
        assert!(is_transient_io(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient_io(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_transient_io(&io::Error::from_raw_os_error(libc::EAGAIN)));
        assert!(!is_transient_io(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient_io(&io::Error::from(io::ErrorKind::NotFound)));
    }

    #[test]
    fn test_conflict_is_retryable() {
        let id = uuid::Uuid::new_v4();
        let err = JobError::Conflict {
            id,
            expected: 3,
            actual: 4,
        };
        assert!(err.is_retryable());
        assert!(!JobError::Validation("missing name".into()).is_retryable());
        assert!(JobError::Storage(StorageError::Unavailable).is_retryable());
    }

    #[test]
    fn test_binary_missing_message_is_actionable() {
        let err = JobError::BinaryMissing {
            binary: "rclone".into(),
            hint: "install rclone or set tools.rclone_path".into(),
        };
        assert_eq!(
            err.to_string(),
            "rclone not found: install rclone or set tools.rclone_path"
        );
    }
}
