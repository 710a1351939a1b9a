//! Durable job store.
//!
//! The whole job collection is one JSON document. Writes are funnelled
//! through a channel to a single writer thread; each write takes an
//! exclusive advisory lock, backs up the previous good document, writes a
//! temp file, fsyncs it and renames it over the target. Readers therefore
//! only ever see a complete document.
//!
//! On load the document is validated. An invalid document is recovered from
//! the backup; if the backup is also unusable loading fails loudly instead of
//! returning an empty collection.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::error_log::ErrorLog;
use crate::model::{Job, JobId};
use crate::recovery::{retry_with_backoff, BreakerError, CircuitBreaker, RetryPolicy};

/// Current on-disk document version.
pub const FORMAT_VERSION: u32 = 1;

const COMPONENT: &str = "storage";

/// Job records keyed by id. Ordered so the document diffs cleanly.
pub type JobCollection = BTreeMap<JobId, Job>;

type Ack = Sender<Result<(), StorageError>>;

/// Receives the outcome of one queued write.
pub type WriteTicket = Receiver<Result<(), StorageError>>;

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    format_version: u32,
    saved_at: DateTime<Utc>,
    jobs: JobCollection,
}

/// The files making up one store.
#[derive(Debug, Clone, PartialEq)]
pub struct StorePaths {
    pub primary: PathBuf,
    pub backup: PathBuf,
    pub temp: PathBuf,
    pub lock: PathBuf,
}

impl StorePaths {
    pub fn new(primary: impl Into<PathBuf>) -> Self {
        let primary = primary.into();
        let with_suffix = |suffix: &str| {
            let mut name = primary.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        };
        StorePaths {
            backup: with_suffix(".bak"),
            temp: with_suffix(".tmp"),
            lock: with_suffix(".lock"),
            primary,
        }
    }
}

enum Request {
    Save { jobs: JobCollection, ack: Option<Ack> },
    Flush { ack: Ack },
}

/// Handle to the job store and its writer thread.
pub struct JobStorage {
    paths: StorePaths,
    error_log: Arc<ErrorLog>,
    tx: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
}

impl JobStorage {
    /// Open the store at `primary` and start its writer thread.
    pub fn open(
        primary: impl Into<PathBuf>,
        config: &StorageConfig,
        error_log: Arc<ErrorLog>,
    ) -> Result<Self, StorageError> {
        let paths = StorePaths::new(primary);
        if let Some(parent) = paths.primary.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let writer = Writer {
            paths: paths.clone(),
            policy: config.write_retry,
            breaker: CircuitBreaker::new(COMPONENT, config.breaker_threshold, config.breaker_cooldown),
            error_log: Arc::clone(&error_log),
            persisted_versions: HashMap::new(),
            primary_known_good: false,
            pending: None,
        };
        let worker = thread::Builder::new()
            .name("shuttle-store-writer".into())
            .spawn(move || writer.run(rx))
            .map_err(|e| StorageError::io(&paths.primary, e))?;

        Ok(JobStorage {
            paths,
            error_log,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Load and validate the job collection, falling back to the backup.
    pub fn load(&self) -> Result<JobCollection, StorageError> {
        load_from(&self.paths, &self.error_log)
    }

    /// Persist `jobs` and wait until the write is durable.
    pub fn save(&self, jobs: JobCollection) -> Result<(), StorageError> {
        let ticket = self.enqueue(jobs)?;
        ticket.recv().map_err(|_| StorageError::WriterGone)?
    }

    /// Queue `jobs` for writing; the returned ticket yields the outcome.
    ///
    /// Never blocks, so it is safe to call while holding the job-map lock.
    pub fn enqueue(&self, jobs: JobCollection) -> Result<WriteTicket, StorageError> {
        let (ack, ticket) = crossbeam_channel::bounded(1);
        self.send(Request::Save {
            jobs,
            ack: Some(ack),
        })?;
        Ok(ticket)
    }

    /// Queue `jobs` without waiting. Failures are recorded by the writer.
    pub fn save_detached(&self, jobs: JobCollection) -> Result<(), StorageError> {
        self.send(Request::Save { jobs, ack: None })
    }

    /// Wait until every previously queued write has been attempted.
    pub fn flush(&self) -> Result<(), StorageError> {
        let (ack, ticket) = crossbeam_channel::bounded(1);
        self.send(Request::Flush { ack })?;
        ticket.recv().map_err(|_| StorageError::WriterGone)?
    }

    fn send(&self, request: Request) -> Result<(), StorageError> {
        self.tx
            .as_ref()
            .ok_or(StorageError::WriterGone)?
            .send(request)
            .map_err(|_| StorageError::WriterGone)
    }
}

impl Drop for JobStorage {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain and exit
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct Writer {
    paths: StorePaths,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    error_log: Arc<ErrorLog>,
    persisted_versions: HashMap<JobId, u64>,
    primary_known_good: bool,
    /// Newest snapshot whose write failed, retried on the next wake-up
    pending: Option<JobCollection>,
}

impl Writer {
    fn run(mut self, rx: Receiver<Request>) {
        loop {
            let first = if self.pending.is_some() {
                rx.recv_timeout(self.policy.max_delay)
            } else {
                rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
            };

            let mut latest = self.pending.take();
            let mut waiters: Vec<Ack> = Vec::new();
            let disconnected = match first {
                Ok(request) => {
                    absorb(request, &mut latest, &mut waiters);
                    false
                }
                Err(RecvTimeoutError::Timeout) => false,
                Err(RecvTimeoutError::Disconnected) => true,
            };
            // Coalesce everything already queued; the newest snapshot wins
            while let Ok(request) = rx.try_recv() {
                absorb(request, &mut latest, &mut waiters);
            }

            let result = match latest {
                Some(jobs) => self.write(jobs),
                None => Ok(()),
            };
            for waiter in waiters {
                let _ = waiter.send(replicate(&result));
            }

            if disconnected {
                if self.pending.is_some() {
                    self.error_log.critical(
                        COMPONENT,
                        None,
                        "job store closed with an unsaved snapshot after repeated write failures",
                    );
                }
                break;
            }
        }
    }

    fn write(&mut self, jobs: JobCollection) -> Result<(), StorageError> {
        for (id, job) in &jobs {
            if let Some(&persisted) = self.persisted_versions.get(id) {
                if job.version < persisted {
                    let err = StorageError::StaleVersion {
                        id: *id,
                        incoming: job.version,
                        persisted,
                    };
                    self.error_log.error(COMPONENT, Some(*id), err.to_string());
                    return Err(err);
                }
            }
        }

        let paths = &self.paths;
        let known_good = self.primary_known_good;
        let outcome = self.breaker.call(|| {
            retry_with_backoff(COMPONENT, &self.policy, StorageError::is_transient, |_| {
                write_document(paths, &jobs, known_good)
            })
        });

        match outcome {
            Ok(()) => {
                self.primary_known_good = true;
                self.persisted_versions = jobs.iter().map(|(id, job)| (*id, job.version)).collect();
                Ok(())
            }
            Err(BreakerError::Open) => {
                self.pending = Some(jobs);
                Err(StorageError::Unavailable)
            }
            Err(BreakerError::Inner(err)) => {
                self.error_log
                    .error(COMPONENT, None, format!("failed to persist job store: {}", err));
                self.pending = Some(jobs);
                Err(err)
            }
        }
    }
}

fn absorb(request: Request, latest: &mut Option<JobCollection>, waiters: &mut Vec<Ack>) {
    match request {
        Request::Save { jobs, ack } => {
            *latest = Some(jobs);
            waiters.extend(ack);
        }
        Request::Flush { ack } => waiters.push(ack),
    }
}

/// Copy a write result for every coalesced waiter.
fn replicate(result: &Result<(), StorageError>) -> Result<(), StorageError> {
    match result {
        Ok(()) => Ok(()),
        Err(StorageError::Io { path, source }) => Err(StorageError::Io {
            path: path.clone(),
            source: io::Error::new(source.kind(), source.to_string()),
        }),
        Err(StorageError::Encode(e)) => Err(StorageError::Io {
            path: PathBuf::new(),
            source: io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
        }),
        Err(StorageError::Corrupt {
            path,
            reason,
            backup_reason,
        }) => Err(StorageError::Corrupt {
            path: path.clone(),
            reason: reason.clone(),
            backup_reason: backup_reason.clone(),
        }),
        Err(StorageError::Unavailable) => Err(StorageError::Unavailable),
        Err(StorageError::WriterGone) => Err(StorageError::WriterGone),
        Err(StorageError::StaleVersion {
            id,
            incoming,
            persisted,
        }) => Err(StorageError::StaleVersion {
            id: *id,
            incoming: *incoming,
            persisted: *persisted,
        }),
    }
}

/// One complete locked write: backup, temp file, fsync, rename.
fn write_document(
    paths: &StorePaths,
    jobs: &JobCollection,
    primary_known_good: bool,
) -> Result<(), StorageError> {
    let _lock = FileLock::acquire(&paths.lock).map_err(|e| StorageError::io(&paths.lock, e))?;

    if paths.primary.exists() {
        // Never replace a good backup with a corrupt primary
        let previous_good =
            primary_known_good || matches!(read_valid(&paths.primary), Ok(Some(_)));
        if previous_good {
            fs::copy(&paths.primary, &paths.backup).map_err(|e| StorageError::io(&paths.backup, e))?;
        }
    }

    let document = StoreDocument {
        format_version: FORMAT_VERSION,
        saved_at: Utc::now(),
        jobs: jobs.clone(),
    };
    {
        let file = File::create(&paths.temp).map_err(|e| StorageError::io(&paths.temp, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &document)?;
        writer.flush().map_err(|e| StorageError::io(&paths.temp, e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| StorageError::io(&paths.temp, e))?;
    }

    fs::rename(&paths.temp, &paths.primary).map_err(|e| StorageError::io(&paths.primary, e))?;
    sync_parent_dir(&paths.primary);
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        let dir = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

/// Why a document could not be used.
enum ReadFailure {
    Io(io::Error),
    Invalid(String),
}

/// Read and validate a store document. `Ok(None)` when the file is absent.
fn read_valid(path: &Path) -> Result<Option<JobCollection>, ReadFailure> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ReadFailure::Io(e)),
    };
    let document: StoreDocument =
        serde_json::from_slice(&bytes).map_err(|e| ReadFailure::Invalid(e.to_string()))?;
    validate_document(&document).map_err(ReadFailure::Invalid)?;
    Ok(Some(document.jobs))
}

fn validate_document(document: &StoreDocument) -> Result<(), String> {
    if document.format_version == 0 || document.format_version > FORMAT_VERSION {
        return Err(format!("unsupported format_version {}", document.format_version));
    }
    for (key, job) in &document.jobs {
        if *key != job.id {
            return Err(format!("record keyed {} carries id {}", key, job.id));
        }
        if job.name.trim().is_empty() || job.source.is_empty() || job.dest.is_empty() {
            return Err(format!("job {} is missing required fields", key));
        }
        let percent = job.progress.percent;
        if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
            return Err(format!("job {} has out-of-range percent {}", key, percent));
        }
        if job.updated_at < job.created_at {
            return Err(format!("job {} was updated before it was created", key));
        }
    }
    Ok(())
}

fn load_from(paths: &StorePaths, error_log: &ErrorLog) -> Result<JobCollection, StorageError> {
    let primary_problem = match read_valid(&paths.primary) {
        Ok(Some(jobs)) => return Ok(jobs),
        Ok(None) => None,
        Err(ReadFailure::Io(e)) => return Err(StorageError::io(&paths.primary, e)),
        Err(ReadFailure::Invalid(reason)) => Some(reason),
    };

    match read_valid(&paths.backup) {
        Ok(Some(jobs)) => {
            let reason = primary_problem.as_deref().unwrap_or("file missing");
            error_log.recovered(
                COMPONENT,
                None,
                format!(
                    "job store {} unusable ({}); recovered {} jobs from backup {}",
                    paths.primary.display(),
                    reason,
                    jobs.len(),
                    paths.backup.display()
                ),
            );
            Ok(jobs)
        }
        Ok(None) => match primary_problem {
            None => Ok(JobCollection::new()),
            Some(reason) => {
                let err = StorageError::Corrupt {
                    path: paths.primary.clone(),
                    reason,
                    backup_reason: "no backup present".to_string(),
                };
                error_log.critical(COMPONENT, None, err.to_string());
                Err(err)
            }
        },
        Err(ReadFailure::Io(e)) => Err(StorageError::io(&paths.backup, e)),
        Err(ReadFailure::Invalid(backup_reason)) => {
            let err = StorageError::Corrupt {
                path: paths.primary.clone(),
                reason: primary_problem.unwrap_or_else(|| "file missing".to_string()),
                backup_reason,
            };
            error_log.critical(COMPONENT, None, err.to_string());
            Err(err)
        }
    }
}

/// Exclusive advisory lock on a sidecar file, released on drop.
///
/// The primary document is replaced by rename on every write, so the lock
/// lives on a separate file whose inode never changes.
pub struct FileLock {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: File,
}

impl FileLock {
    /// Try to take the lock without blocking; contention is `WouldBlock`.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}
