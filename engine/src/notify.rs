//! Batched job-update notifications.
//!
//! Updates are collected per job (latest wins) and delivered as one batch at
//! most once per `min_flush_interval`. A job that reached `completed` or
//! `failed` gets exactly one final update; later updates for it are dropped
//! until it runs again. A queued final update is never replaced: if the job
//! restarts before the flush, the batch carries both.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use crate::model::{DeletionPhase, Job, JobId, JobStatus};

/// What subscribers learn about a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    pub percent: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub speed: f64,
    pub eta_seconds: Option<u64>,
    pub deletion: DeletionUpdate,
    pub error: Option<String>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletionUpdate {
    pub phase: DeletionPhase,
    pub files_deleted: u64,
    pub bytes_deleted: u64,
}

impl From<&Job> for JobUpdate {
    fn from(job: &Job) -> Self {
        JobUpdate {
            job_id: job.id,
            status: job.status,
            percent: job.progress.percent,
            bytes_transferred: job.progress.bytes_transferred,
            total_bytes: job.progress.total_bytes,
            speed: job.progress.speed,
            eta_seconds: job.progress.eta_seconds,
            deletion: DeletionUpdate {
                phase: job.progress.deletion.phase,
                files_deleted: job.progress.deletion.files_deleted,
                bytes_deleted: job.progress.deletion.bytes_deleted,
            },
            error: job.error.clone(),
            version: job.version,
        }
    }
}

type Callback = Arc<dyn Fn(&[JobUpdate]) + Send + Sync>;

#[derive(Default)]
struct Batch {
    /// Per job, in order: any final updates, then the latest other update
    pending: BTreeMap<JobId, Vec<JobUpdate>>,
    /// Jobs whose final update was accepted
    finalized: HashSet<JobId>,
    last_flush: Option<Instant>,
}

#[derive(Default)]
struct Subscribers {
    callbacks: Vec<Callback>,
    channels: Vec<Sender<Vec<JobUpdate>>>,
}

/// Rate-limited fan-out of job updates.
pub struct NotificationChannel {
    min_interval: Duration,
    batch: Mutex<Batch>,
    subscribers: Mutex<Subscribers>,
}

impl NotificationChannel {
    pub fn new(min_interval: Duration) -> Self {
        NotificationChannel {
            min_interval,
            batch: Mutex::new(Batch::default()),
            subscribers: Mutex::new(Subscribers::default()),
        }
    }

    /// Register a callback receiving every batch.
    pub fn subscribe_to_updates<F>(&self, callback: F)
    where
        F: Fn(&[JobUpdate]) + Send + Sync + 'static,
    {
        self.subscribers.lock().callbacks.push(Arc::new(callback));
    }

    /// Receive batches on a channel. Dropping the receiver unsubscribes.
    pub fn subscribe_channel(&self) -> Receiver<Vec<JobUpdate>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().channels.push(tx);
        rx
    }

    /// Queue an update. Returns false when it was dropped because the job
    /// already had its final update.
    pub fn publish(&self, update: JobUpdate) -> bool {
        let mut batch = self.batch.lock();
        let id = update.job_id;
        if update.status == JobStatus::Running {
            batch.finalized.remove(&id);
        } else if batch.finalized.contains(&id) {
            return false;
        }
        if update.status.is_terminal() {
            batch.finalized.insert(id);
        }
        let queued = batch.pending.entry(id).or_default();
        if queued.last().map_or(false, |last| !last.status.is_terminal()) {
            queued.pop();
        }
        queued.push(update);
        true
    }

    /// Drop the bookkeeping for a deleted job. An update already queued for
    /// it is still delivered.
    pub fn forget(&self, job_id: JobId) {
        self.batch.lock().finalized.remove(&job_id);
    }

    /// Flush if `min_interval` has passed since the last batch.
    pub fn flush_due(&self, now: Instant) -> usize {
        let due = self
            .batch
            .lock()
            .last_flush
            .map_or(true, |last| now.saturating_duration_since(last) >= self.min_interval);
        if due {
            self.flush()
        } else {
            0
        }
    }

    /// Deliver everything queued now. Returns the batch size.
    pub fn flush(&self) -> usize {
        let updates: Vec<JobUpdate> = {
            let mut batch = self.batch.lock();
            batch.last_flush = Some(Instant::now());
            std::mem::take(&mut batch.pending).into_values().flatten().collect()
        };
        if updates.is_empty() {
            return 0;
        }

        let (callbacks, channels) = {
            let subscribers = self.subscribers.lock();
            (subscribers.callbacks.clone(), subscribers.channels.clone())
        };
        for callback in &callbacks {
            callback(&updates);
        }
        let gone: Vec<Sender<Vec<JobUpdate>>> = channels
            .into_iter()
            .filter(|tx| tx.send(updates.clone()).is_err())
            .collect();
        if !gone.is_empty() {
            self.subscribers
                .lock()
                .channels
                .retain(|tx| !gone.iter().any(|dead| dead.same_channel(tx)));
        }

        tracing::debug!(component = "notify", updates = updates.len(), "batch delivered");
        updates.len()
    }
}
