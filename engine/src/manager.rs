//! Job orchestration.
//!
//! `JobManager` owns the in-memory job map and the map of live engines and
//! is the only place job state changes. Rules:
//! - Lock order is job map, then engine map; never the reverse
//! - Process I/O and waiting for durability happen outside both locks
//! - Snapshots are queued to the store while holding the job-map lock, so
//!   the persisted order is the mutation order
//! - Read-then-write operations capture `version` and fail with `Conflict`
//!   when it moved in between

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::config::{Config, ManagerConfig};
use crate::error::{JobError, StorageError};
use crate::error_log::ErrorLog;
use crate::model::{
    DeletionPhase, DeletionProgress, Job, JobConfig, JobId, JobSettings, JobSnapshot, JobStatus, Progress,
    SettingsPatch,
};
use crate::progress::{EngineState, ProgressSnapshot};
use crate::storage::{JobCollection, JobStorage, WriteTicket};
use crate::transfer::{Engine, EngineFactory, EngineSettings, ToolEngineFactory};

const COMPONENT: &str = "manager";

/// Result of folding an engine snapshot into its job.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Job not running, engine idle or stopped, or nothing changed
    Ignored,
    Progress(JobSnapshot),
    /// The job just reached `completed` or `failed`
    Terminal(JobSnapshot),
}

struct EngineEntry {
    engine: Arc<dyn Engine>,
    /// Set once the job stopped depending on this engine
    finished_at: Option<Instant>,
}

impl EngineEntry {
    fn is_live(&self) -> bool {
        self.finished_at.is_none() && !self.engine.progress().state.is_finished()
    }
}

#[derive(Default)]
struct ListCache {
    jobs: Vec<JobSnapshot>,
    refreshed_at: Option<Instant>,
}

/// The orchestrator. Share it as `Arc<JobManager>`.
pub struct JobManager {
    jobs: RwLock<JobCollection>,
    engines: Mutex<HashMap<JobId, EngineEntry>>,
    storage: JobStorage,
    factory: Arc<dyn EngineFactory>,
    error_log: Arc<ErrorLog>,
    list_cache: Mutex<ListCache>,
    cache_dirty: AtomicBool,
    config: ManagerConfig,
}

fn wait(ticket: WriteTicket) -> Result<(), StorageError> {
    ticket.recv().map_err(|_| StorageError::WriterGone)?
}

/// Progress a job starts a new run with. Deletion totals are cumulative.
fn progress_for_run(previous: &Progress, settings: &JobSettings) -> Progress {
    Progress {
        deletion: DeletionProgress {
            enabled: settings.deletion_enabled,
            mode: settings.deletion_mode,
            phase: if settings.deletion_enabled {
                DeletionPhase::Transferring
            } else {
                DeletionPhase::None
            },
            files_deleted: previous.deletion.files_deleted,
            bytes_deleted: previous.deletion.bytes_deleted,
        },
        ..Progress::default()
    }
}

/// Copy engine state into `job`, bumping the version. False when nothing changed.
fn apply_snapshot(job: &mut Job, snapshot: &ProgressSnapshot) -> bool {
    let status = match snapshot.state {
        EngineState::Completed => JobStatus::Completed,
        EngineState::Failed => JobStatus::Failed,
        _ => JobStatus::Running,
    };
    let unchanged = job.status == status
        && job.progress == snapshot.progress
        && job.attempts == snapshot.restarts();
    if unchanged {
        return false;
    }

    let now = Utc::now();
    job.progress = snapshot.progress.clone();
    job.attempts = snapshot.restarts();
    if status != JobStatus::Running {
        job.status = status;
        job.error = snapshot.error.clone();
        job.finished_at = Some(now);
    }
    job.version += 1;
    job.updated_at = now;
    true
}

impl JobManager {
    /// Open the store under `config.data_dir` with the rsync/rclone engines.
    pub fn open(config: &Config) -> Result<Self, JobError> {
        let log_path = config.error_log_path();
        let error_log = Arc::new(ErrorLog::open(&log_path).map_err(|e| StorageError::io(&log_path, e))?);
        let settings = EngineSettings::from_config(config, Arc::clone(&error_log));
        Self::with_factory(config, Arc::new(ToolEngineFactory::new(settings)), error_log)
    }

    /// Open with a custom engine factory.
    pub fn with_factory(
        config: &Config,
        factory: Arc<dyn EngineFactory>,
        error_log: Arc<ErrorLog>,
    ) -> Result<Self, JobError> {
        let storage = JobStorage::open(config.jobs_path(), &config.storage, Arc::clone(&error_log))?;
        let jobs = storage.load()?;
        tracing::info!(
            component = COMPONENT,
            jobs = jobs.len(),
            path = %storage.paths().primary.display(),
            "job store loaded"
        );

        Ok(JobManager {
            jobs: RwLock::new(jobs),
            engines: Mutex::new(HashMap::new()),
            storage,
            factory,
            error_log,
            list_cache: Mutex::new(ListCache::default()),
            cache_dirty: AtomicBool::new(true),
            config: config.manager.clone(),
        })
    }

    pub fn error_log(&self) -> &Arc<ErrorLog> {
        &self.error_log
    }

    /// Directory holding the job store.
    pub fn data_dir(&self) -> &Path {
        self.storage
            .paths()
            .primary
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    fn mark_dirty(&self) {
        self.cache_dirty.store(true, Ordering::Release);
    }

    fn validate(&self, config: &JobConfig) -> Result<(), JobError> {
        let invalid = |message: &str| Err(JobError::Validation(message.to_string()));
        if config.name.trim().is_empty() {
            return invalid("name is required");
        }
        if config.source.trim().is_empty() {
            return invalid("source is required");
        }
        if config.dest.trim().is_empty() {
            return invalid("destination is required");
        }
        if config.source == config.dest {
            return invalid("source and destination must differ");
        }
        if config.settings.bandwidth_limit == Some(0) {
            return invalid("bandwidth limit must be greater than zero");
        }
        if config.settings.deletion_enabled && !config.settings.deletion_confirmed {
            return invalid("source deletion requires explicit confirmation (deletion_confirmed)");
        }
        self.factory.validate_config(config).map_err(JobError::Validation)
    }

    /// Validate and persist a new pending job.
    pub fn create_job(&self, config: JobConfig) -> Result<JobId, JobError> {
        if let Err(e) = self.validate(&config) {
            tracing::debug!(component = COMPONENT, name = %config.name, error = %e, "job rejected");
            return Err(e);
        }

        let job = Job::from_config(config, Utc::now());
        let id = job.id;
        let name = job.name.clone();
        let ticket = {
            let mut jobs = self.jobs.write();
            jobs.insert(id, job);
            self.storage.enqueue(jobs.clone())
        };

        if let Err(e) = ticket.and_then(wait) {
            let mut jobs = self.jobs.write();
            jobs.remove(&id);
            let _ = self.storage.save_detached(jobs.clone());
            drop(jobs);
            self.error_log
                .error(COMPONENT, Some(id), format!("could not persist new job: {}", e));
            return Err(e.into());
        }

        self.mark_dirty();
        tracing::info!(component = COMPONENT, job_id = %id, %name, "job created");
        Ok(id)
    }

    /// Launch a pending, paused or failed job.
    pub fn start_job(&self, id: JobId) -> Result<(), JobError> {
        let (transfer_type, version) = {
            let jobs = self.jobs.read();
            let job = jobs.get(&id).ok_or(JobError::NotFound(id))?;
            if !job.is_startable() {
                return Err(JobError::NotStartable { id, status: job.status });
            }
            (job.transfer_type, job.version)
        };

        // Filesystem lookups, so outside the locks
        self.factory.preflight(transfer_type)?;

        let (engine, snapshot, ticket) = {
            let mut jobs = self.jobs.write();
            let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
            if job.version != version {
                return Err(JobError::Conflict {
                    id,
                    expected: version,
                    actual: job.version,
                });
            }
            if !job.is_startable() {
                return Err(JobError::NotStartable { id, status: job.status });
            }

            let engine = {
                let mut engines = self.engines.lock();
                if engines.get(&id).map_or(false, EngineEntry::is_live) {
                    return Err(JobError::AlreadyRunning(id));
                }
                let engine = self.factory.create(job);
                engines.insert(
                    id,
                    EngineEntry {
                        engine: Arc::clone(&engine),
                        finished_at: None,
                    },
                );
                engine
            };

            let now = Utc::now();
            job.status = JobStatus::Running;
            job.progress = progress_for_run(&job.progress, &job.settings);
            job.error = None;
            job.attempts = 0;
            job.started_at = Some(now);
            job.finished_at = None;
            job.version += 1;
            job.updated_at = now;
            let snapshot = job.clone();
            (engine, snapshot, self.storage.enqueue(jobs.clone()))
        };
        self.mark_dirty();

        if let Err(e) = ticket.and_then(wait) {
            let message = format!("could not persist job start: {}", e);
            self.fail_job(id, &message);
            return Err(e.into());
        }

        if let Err(source) = engine.start(&snapshot) {
            self.fail_job(id, &format!("launch failed: {}", source));
            return Err(JobError::Launch { id, source });
        }

        tracing::info!(
            component = COMPONENT,
            job_id = %id,
            transfer_type = %snapshot.transfer_type,
            version = snapshot.version,
            "job started"
        );
        Ok(())
    }

    /// Move a running job to `failed` after its launch went wrong.
    fn fail_job(&self, id: JobId, message: &str) {
        self.error_log.error(COMPONENT, Some(id), message);
        {
            let mut jobs = self.jobs.write();
            if let Some(job) = jobs.get_mut(&id).filter(|job| job.status == JobStatus::Running) {
                let now = Utc::now();
                job.status = JobStatus::Failed;
                job.error = Some(message.to_string());
                job.finished_at = Some(now);
                job.version += 1;
                job.updated_at = now;
                if let Err(e) = self.storage.save_detached(jobs.clone()) {
                    tracing::error!(component = COMPONENT, job_id = %id, error = %e, "could not queue failed job");
                }
            }
        }
        self.mark_engine_finished(id);
        self.mark_dirty();
    }

    /// Stop a running job and mark it paused. A no-op for any other state.
    pub fn pause_job(&self, id: JobId) -> Result<(), JobError> {
        let engine = {
            let jobs = self.jobs.read();
            let job = jobs.get(&id).ok_or(JobError::NotFound(id))?;
            if job.status != JobStatus::Running {
                tracing::debug!(component = COMPONENT, job_id = %id, status = %job.status, "pause ignored");
                return Ok(());
            }
            let engines = self.engines.lock();
            engines.get(&id).map(|entry| Arc::clone(&entry.engine))
        };

        if let Some(engine) = &engine {
            engine
                .stop(self.config.stop_grace)
                .map_err(|source| JobError::JobNotStoppable { id, source })?;
        }
        let final_snapshot = engine.as_ref().map(|engine| engine.progress());

        let ticket = {
            let mut jobs = self.jobs.write();
            let Some(job) = jobs.get_mut(&id) else {
                return Ok(());
            };
            if job.status != JobStatus::Running {
                return Ok(());
            }

            match &final_snapshot {
                // Finished on its own before the stop landed
                Some(snapshot) if matches!(snapshot.state, EngineState::Completed | EngineState::Failed) => {
                    apply_snapshot(job, snapshot);
                }
                _ => {
                    if let Some(snapshot) = &final_snapshot {
                        job.progress = snapshot.progress.clone();
                        job.attempts = snapshot.restarts();
                    }
                    job.status = JobStatus::Paused;
                    job.version += 1;
                    job.updated_at = Utc::now();
                }
            }
            let ticket = self.storage.enqueue(jobs.clone());
            if let Some(entry) = self.engines.lock().get_mut(&id) {
                entry.finished_at.get_or_insert_with(Instant::now);
            }
            ticket
        };
        self.mark_dirty();

        ticket.and_then(wait)?;
        tracing::info!(component = COMPONENT, job_id = %id, "job paused");
        Ok(())
    }

    /// Stop any live engine and remove the job from memory and storage.
    pub fn delete_job(&self, id: JobId) -> Result<(), JobError> {
        let engine = {
            let jobs = self.jobs.read();
            if !jobs.contains_key(&id) {
                return Err(JobError::NotFound(id));
            }
            let engines = self.engines.lock();
            engines.get(&id).map(|entry| Arc::clone(&entry.engine))
        };

        if let Some(engine) = engine {
            engine.stop(self.config.stop_grace).map_err(|source| {
                self.error_log
                    .error(COMPONENT, Some(id), format!("could not stop transfer for deletion: {}", source));
                JobError::JobNotStoppable { id, source }
            })?;
        }

        let ticket = {
            let mut jobs = self.jobs.write();
            if jobs.remove(&id).is_none() {
                return Err(JobError::NotFound(id));
            }
            self.engines.lock().remove(&id);
            self.storage.enqueue(jobs.clone())
        };
        self.mark_dirty();

        ticket.and_then(wait)?;
        tracing::info!(component = COMPONENT, job_id = %id, "job deleted");
        Ok(())
    }

    /// Current state of one job.
    pub fn get_job_status(&self, id: JobId) -> Result<JobSnapshot, JobError> {
        self.jobs.read().get(&id).cloned().ok_or(JobError::NotFound(id))
    }

    /// All jobs, oldest first. May be stale by up to the cache TTL.
    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        let mut cache = self.list_cache.lock();
        let fresh = cache
            .refreshed_at
            .map_or(false, |at| at.elapsed() < self.config.list_cache_ttl);
        if fresh && !self.cache_dirty.load(Ordering::Acquire) {
            return cache.jobs.clone();
        }

        // Cleared before reading so a concurrent mutation marks it again
        self.cache_dirty.store(false, Ordering::Release);
        let mut jobs: Vec<JobSnapshot> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        cache.jobs = jobs.clone();
        cache.refreshed_at = Some(Instant::now());
        jobs
    }

    /// Fold an engine snapshot into a running job.
    pub fn update_job_from_engine(&self, id: JobId, snapshot: &ProgressSnapshot) -> Result<UpdateOutcome, JobError> {
        if matches!(snapshot.state, EngineState::Idle | EngineState::Stopped) {
            return Ok(UpdateOutcome::Ignored);
        }

        let updated = {
            let mut jobs = self.jobs.write();
            let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
            if job.status != JobStatus::Running || !apply_snapshot(job, snapshot) {
                return Ok(UpdateOutcome::Ignored);
            }
            let updated = job.clone();
            if let Err(e) = self.storage.save_detached(jobs.clone()) {
                self.error_log
                    .error(COMPONENT, Some(id), format!("could not queue progress update: {}", e));
            }
            updated
        };
        self.mark_dirty();

        if updated.status.is_terminal() {
            self.mark_engine_finished(id);
            tracing::info!(
                component = COMPONENT,
                job_id = %id,
                status = %updated.status,
                files = updated.progress.files_transferred,
                bytes = updated.progress.bytes_transferred,
                "job finished"
            );
            return Ok(UpdateOutcome::Terminal(updated));
        }
        Ok(UpdateOutcome::Progress(updated))
    }

    /// Edit the mutable settings of a job that is not running.
    pub fn update_job_settings(
        &self,
        id: JobId,
        expected_version: u64,
        patch: &SettingsPatch,
    ) -> Result<JobSnapshot, JobError> {
        if patch.bandwidth_limit == Some(Some(0)) {
            return Err(JobError::Validation("bandwidth limit must be greater than zero".into()));
        }

        let (updated, ticket) = {
            let mut jobs = self.jobs.write();
            let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
            if job.version != expected_version {
                return Err(JobError::Conflict {
                    id,
                    expected: expected_version,
                    actual: job.version,
                });
            }
            if job.status == JobStatus::Running {
                return Err(JobError::InvalidState {
                    id,
                    status: job.status,
                    action: "edited",
                });
            }
            if !patch.apply(&mut job.settings) {
                return Ok(job.clone());
            }
            job.version += 1;
            job.updated_at = Utc::now();
            let updated = job.clone();
            (updated, self.storage.enqueue(jobs.clone()))
        };
        self.mark_dirty();

        ticket.and_then(wait)?;
        tracing::info!(component = COMPONENT, job_id = %id, version = updated.version, "job settings updated");
        Ok(updated)
    }

    /// Pause jobs persisted as running by a process that is gone.
    ///
    /// Returns the ids of the recovered jobs so the caller can offer a resume.
    pub fn recover_interrupted_jobs(&self) -> Result<Vec<JobId>, JobError> {
        let (recovered, ticket) = {
            let mut jobs = self.jobs.write();
            let engines = self.engines.lock();
            let now = Utc::now();
            let mut recovered = Vec::new();
            for job in jobs.values_mut() {
                if job.status != JobStatus::Running || engines.get(&job.id).map_or(false, EngineEntry::is_live) {
                    continue;
                }
                job.status = JobStatus::Paused;
                job.progress.speed = 0.0;
                job.progress.eta_seconds = None;
                job.version += 1;
                job.updated_at = now;
                recovered.push(job.id);
            }
            drop(engines);
            if recovered.is_empty() {
                return Ok(recovered);
            }
            (recovered, self.storage.enqueue(jobs.clone()))
        };
        self.mark_dirty();

        ticket.and_then(wait)?;
        for id in &recovered {
            self.error_log.recovered(
                COMPONENT,
                Some(*id),
                "job was running when the previous process exited; paused for resume",
            );
        }
        Ok(recovered)
    }

    /// Engines the monitor should poll.
    pub fn live_engines(&self) -> Vec<(JobId, Arc<dyn Engine>)> {
        self.engines
            .lock()
            .iter()
            .filter(|(_, entry)| entry.finished_at.is_none())
            .map(|(id, entry)| (*id, Arc::clone(&entry.engine)))
            .collect()
    }

    /// Stop polling the engine of a job; it becomes eligible for sweeping.
    pub fn mark_engine_finished(&self, id: JobId) {
        if let Some(entry) = self.engines.lock().get_mut(&id) {
            entry.finished_at.get_or_insert_with(Instant::now);
        }
    }

    /// Drop engines finished for longer than `retention`.
    pub fn sweep_engines(&self, retention: Duration) -> Vec<JobId> {
        let mut engines = self.engines.lock();
        let expired: Vec<JobId> = engines
            .iter()
            .filter(|(_, entry)| entry.finished_at.map_or(false, |at| at.elapsed() >= retention))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            engines.remove(id);
        }
        expired
    }

    pub fn has_running_jobs(&self) -> bool {
        self.jobs.read().values().any(|job| job.status == JobStatus::Running)
    }

    /// Pause every running job and wait for the store to catch up.
    pub fn shutdown(&self) -> Result<(), JobError> {
        let running: Vec<JobId> = self
            .jobs
            .read()
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .map(|job| job.id)
            .collect();
        for id in running {
            if let Err(e) = self.pause_job(id) {
                self.error_log
                    .error(COMPONENT, Some(id), format!("could not pause job during shutdown: {}", e));
            }
        }
        self.storage.flush()?;
        tracing::info!(component = COMPONENT, "manager shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_progress_keeps_deletion_totals() {
        let mut previous = Progress::default();
        previous.percent = 40.0;
        previous.deletion.files_deleted = 3;
        previous.deletion.bytes_deleted = 300;
        let settings = JobSettings {
            deletion_enabled: true,
            deletion_confirmed: true,
            ..JobSettings::default()
        };

        let progress = progress_for_run(&previous, &settings);
        assert_eq!(progress.percent, 0.0);
        assert_eq!(progress.deletion.files_deleted, 3);
        assert_eq!(progress.deletion.phase, DeletionPhase::Transferring);
    }

    #[test]
    fn test_apply_snapshot_only_bumps_on_change() {
        let mut job = Job::from_config(
            JobConfig {
                name: "x".into(),
                source: "/a".into(),
                dest: "/b".into(),
                transfer_type: crate::model::TransferType::Rsync,
                settings: JobSettings::default(),
            },
            Utc::now(),
        );
        job.status = JobStatus::Running;

        let mut snapshot = ProgressSnapshot::idle(job.progress.clone());
        snapshot.state = EngineState::Running;
        snapshot.attempt = 1;
        assert!(!apply_snapshot(&mut job, &snapshot));
        assert_eq!(job.version, 0);

        snapshot.progress.bytes_transferred = 10;
        assert!(apply_snapshot(&mut job, &snapshot));
        assert_eq!(job.version, 1);

        snapshot.state = EngineState::Completed;
        snapshot.error = Some("verification found 1 mismatched of 2 files".into());
        assert!(apply_snapshot(&mut job, &snapshot));
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_some());
        assert!(job.finished_at.is_some());
    }
}
