//! Background control loop.
//!
//! One thread that pulls progress from live engines into the manager,
//! publishes changed jobs to the notification channel, sweeps finished
//! engines and reviews system health. It ticks every second while a job is
//! running and every five seconds otherwise.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::config::MonitorConfig;
use crate::error::{EngineError, JobError};
use crate::error_log::Severity;
use crate::fs_ops;
use crate::manager::{JobManager, UpdateOutcome};
use crate::model::JobId;
use crate::notify::{JobUpdate, NotificationChannel};
use crate::recovery::degrade;

const COMPONENT: &str = "monitor";

/// Free space below which the data directory counts as degraded.
const LOW_SPACE_BYTES: u64 = 100 * 1024 * 1024;

/// Result of the last health review.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthStatus {
    pub degraded: bool,
    /// Errors (and worse) recorded during the last health window
    pub recent_errors: usize,
    pub reasons: Vec<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

/// Drives progress propagation, notifications and cleanup.
pub struct BackgroundMonitor {
    manager: Arc<JobManager>,
    notifier: Arc<NotificationChannel>,
    config: MonitorConfig,
    /// Job versions already published
    last_seen: HashMap<JobId, u64>,
    last_cleanup: Instant,
    last_health: Instant,
    health: Arc<Mutex<HealthStatus>>,
}

impl BackgroundMonitor {
    pub fn new(manager: Arc<JobManager>, notifier: Arc<NotificationChannel>, config: MonitorConfig) -> Self {
        let last_seen = manager
            .list_jobs()
            .into_iter()
            .map(|job| (job.id, job.version))
            .collect();
        let now = Instant::now();
        BackgroundMonitor {
            manager,
            notifier,
            config,
            last_seen,
            last_cleanup: now,
            last_health: now,
            health: Arc::new(Mutex::new(HealthStatus::default())),
        }
    }

    /// Startup crash recovery: pause jobs left running by a dead process.
    pub fn recover(&mut self) -> Result<Vec<JobId>, JobError> {
        let recovered = self.manager.recover_interrupted_jobs()?;
        if !recovered.is_empty() {
            tracing::warn!(component = COMPONENT, jobs = recovered.len(), "paused jobs interrupted by a crash");
            self.publish_changes();
        }
        Ok(recovered)
    }

    pub fn health(&self) -> HealthStatus {
        self.health.lock().clone()
    }

    /// One pass of the loop. Returns whether any job is running.
    pub fn tick(&mut self) -> bool {
        let now = Instant::now();

        for (id, engine) in self.manager.live_engines() {
            let snapshot = engine.progress();
            match self.manager.update_job_from_engine(id, &snapshot) {
                Ok(UpdateOutcome::Terminal(job)) => {
                    tracing::debug!(component = COMPONENT, job_id = %id, status = %job.status, "engine finished");
                }
                Ok(_) => {}
                // Deleted between listing and updating
                Err(JobError::NotFound(_)) => self.manager.mark_engine_finished(id),
                Err(e) => {
                    tracing::warn!(component = COMPONENT, job_id = %id, error = %e, "could not apply engine progress");
                }
            }
        }

        self.publish_changes();
        self.notifier.flush_due(now);

        if now.saturating_duration_since(self.last_cleanup) >= self.config.cleanup_interval {
            self.last_cleanup = now;
            let swept = self.manager.sweep_engines(self.config.engine_retention);
            if !swept.is_empty() {
                tracing::info!(component = COMPONENT, engines = swept.len(), "removed finished engines");
            }
        }
        if now.saturating_duration_since(self.last_health) >= self.config.health_interval {
            self.last_health = now;
            self.review_health();
        }

        self.manager.has_running_jobs()
    }

    /// Publish every job whose version changed since the last pass.
    fn publish_changes(&mut self) -> usize {
        let jobs = self.manager.list_jobs();
        let mut seen = HashMap::with_capacity(jobs.len());
        let mut published = 0;
        for job in &jobs {
            if self.last_seen.get(&job.id) != Some(&job.version) && self.notifier.publish(JobUpdate::from(job)) {
                published += 1;
            }
            seen.insert(job.id, job.version);
        }
        for id in self.last_seen.keys().filter(|id| !seen.contains_key(id)) {
            self.notifier.forget(*id);
        }
        self.last_seen = seen;
        published
    }

    fn review_health(&self) {
        let fallback = HealthStatus {
            checked_at: Some(Utc::now()),
            ..self.health()
        };
        let status = degrade(COMPONENT, fallback, || self.check_health());

        let mut current = self.health.lock();
        if status.degraded && !current.degraded {
            tracing::warn!(component = COMPONENT, reasons = ?status.reasons, "system degraded");
        } else if !status.degraded && current.degraded {
            tracing::info!(component = COMPONENT, "system healthy again");
        }
        *current = status;
    }

    fn check_health(&self) -> Result<HealthStatus, EngineError> {
        let recent_errors = self
            .manager
            .error_log()
            .recent(self.config.health_interval)
            .iter()
            .filter(|event| event.severity >= Severity::Error)
            .count();

        let mut reasons = Vec::new();
        if recent_errors > self.config.health_error_threshold {
            reasons.push(format!(
                "{} errors in the last {}s",
                recent_errors,
                self.config.health_interval.as_secs()
            ));
        }
        let available = fs_ops::available_space(self.manager.data_dir())?;
        if available < LOW_SPACE_BYTES {
            reasons.push(format!(
                "only {} bytes free in {}",
                available,
                self.manager.data_dir().display()
            ));
        }

        Ok(HealthStatus {
            degraded: !reasons.is_empty(),
            recent_errors,
            reasons,
            checked_at: Some(Utc::now()),
        })
    }

    /// Run the loop on its own thread.
    pub fn spawn(self) -> io::Result<MonitorHandle> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let health = Arc::clone(&self.health);
        let thread = thread::Builder::new()
            .name("shuttle-monitor".into())
            .spawn(move || self.run(shutdown_rx))?;
        Ok(MonitorHandle {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
            health,
        })
    }

    fn run(mut self, shutdown: Receiver<()>) {
        tracing::info!(component = COMPONENT, "monitor started");
        loop {
            let interval = if self.tick() {
                self.config.active_interval
            } else {
                self.config.idle_interval
            };
            match shutdown.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.publish_changes();
        self.notifier.flush();
        tracing::info!(component = COMPONENT, "monitor stopped");
    }
}

/// Handle to a running monitor thread. Dropping it stops the loop.
pub struct MonitorHandle {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    health: Arc<Mutex<HealthStatus>>,
}

impl MonitorHandle {
    pub fn health(&self) -> HealthStatus {
        self.health.lock().clone()
    }

    /// Stop the loop and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.try_send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(component = COMPONENT, "monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
