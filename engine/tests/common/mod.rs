//! Shared helpers for integration tests: an in-process engine the test
//! drives by hand, and a factory handing it to the manager.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shuttle_engine::{
    Config, Engine, EngineError, EngineFactory, EngineState, ErrorLog, Job, JobConfig, JobError, JobId,
    JobManager, JobSettings, ProgressSnapshot, RetryPolicy, TransferType,
};

pub struct FakeEngine {
    snapshot: Mutex<ProgressSnapshot>,
    stoppable: bool,
    fail_start: bool,
    pub stops: AtomicUsize,
}

impl FakeEngine {
    fn new(job: &Job, stoppable: bool, fail_start: bool) -> Self {
        FakeEngine {
            snapshot: Mutex::new(ProgressSnapshot::idle(job.progress.clone())),
            stoppable,
            fail_start,
            stops: AtomicUsize::new(0),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut ProgressSnapshot)) {
        let mut snapshot = self.snapshot.lock();
        f(&mut snapshot);
    }

    pub fn set_percent(&self, percent: f64, bytes: u64) {
        self.update(|s| {
            s.progress.percent = percent;
            s.progress.bytes_transferred = bytes;
        });
    }

    pub fn complete(&self) {
        self.update(|s| {
            s.state = EngineState::Completed;
            s.progress.percent = 100.0;
        });
    }

    pub fn fail(&self, message: &str) {
        self.update(|s| {
            s.state = EngineState::Failed;
            s.error = Some(message.to_string());
        });
    }
}

impl Engine for FakeEngine {
    fn validate_config(&self, _config: &JobConfig) -> Result<(), String> {
        Ok(())
    }

    fn start(&self, job: &Job) -> Result<(), EngineError> {
        if self.fail_start {
            return Err(EngineError::Process("refusing to start".into()));
        }
        let mut snapshot = self.snapshot.lock();
        snapshot.state = EngineState::Running;
        snapshot.attempt = 1;
        snapshot.progress = job.progress.clone();
        Ok(())
    }

    fn stop(&self, _grace: Duration) -> Result<(), EngineError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.stoppable {
            return Err(EngineError::NotStoppable { pid: 4242 });
        }
        let mut snapshot = self.snapshot.lock();
        if !snapshot.state.is_finished() {
            snapshot.state = EngineState::Stopped;
        }
        Ok(())
    }

    fn progress(&self) -> ProgressSnapshot {
        self.snapshot.lock().clone()
    }
}

#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<(JobId, Arc<FakeEngine>)>>,
    pub binary_missing: AtomicBool,
    pub fail_start: AtomicBool,
    pub unstoppable: AtomicBool,
}

impl FakeFactory {
    /// The most recent engine created for `id`.
    pub fn engine(&self, id: JobId) -> Arc<FakeEngine> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(job_id, _)| *job_id == id)
            .map(|(_, engine)| Arc::clone(engine))
            .expect("no engine created for job")
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }
}

impl EngineFactory for FakeFactory {
    fn validate_config(&self, config: &JobConfig) -> Result<(), String> {
        if config.source.starts_with("bad:") {
            return Err(format!("'{}' is not a valid location", config.source));
        }
        Ok(())
    }

    fn preflight(&self, transfer_type: TransferType) -> Result<(), JobError> {
        if self.binary_missing.load(Ordering::SeqCst) {
            return Err(JobError::BinaryMissing {
                binary: transfer_type.to_string(),
                hint: format!("install {} or set tools.{}_path in the config file", transfer_type, transfer_type),
            });
        }
        Ok(())
    }

    fn create(&self, job: &Job) -> Arc<dyn Engine> {
        let engine = Arc::new(FakeEngine::new(
            job,
            !self.unstoppable.load(Ordering::SeqCst),
            self.fail_start.load(Ordering::SeqCst),
        ));
        self.created.lock().push((job.id, Arc::clone(&engine)));
        engine
    }
}

pub fn test_config(data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.data_dir = data_dir.to_path_buf();
    config.storage.write_retry = RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20));
    config.manager.stop_grace = Duration::from_millis(200);
    config
}

pub fn open_manager(config: &Config) -> (Arc<JobManager>, Arc<FakeFactory>) {
    let factory = Arc::new(FakeFactory::default());
    let error_log = Arc::new(ErrorLog::open(config.error_log_path()).expect("Failed to open error log"));
    let manager = JobManager::with_factory(config, factory.clone(), error_log).expect("Failed to open manager");
    (Arc::new(manager), factory)
}

pub fn job_config(name: &str) -> JobConfig {
    JobConfig {
        name: name.to_string(),
        source: format!("/data/{}", name),
        dest: format!("/backup/{}", name),
        transfer_type: TransferType::Rsync,
        settings: JobSettings::default(),
    }
}
