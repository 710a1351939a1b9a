//! # Shuttle Engine - Transfer Job Orchestration
//!
//! A headless engine that runs long, resumable file transfers through rsync
//! and rclone and survives crashes without losing or corrupting job state.
//! Designed as the core for multiple front ends (CLI, web UI, automation).
//!
//! ## Overview
//!
//! The engine provides:
//! - A job state machine with optimistic versioning
//! - Supervised rsync/rclone processes with progress parsing and
//!   backoff restarts on transient network failures
//! - Deletion safety: free-space guard, verify then delete, move semantics
//! - Crash-safe persistence with backup recovery
//! - A background monitor that propagates progress and batches notifications
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use shuttle_engine::{
//!     BackgroundMonitor, Config, JobConfig, JobManager, JobSettings, NotificationChannel, TransferType,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(None)?;
//! let manager = Arc::new(JobManager::open(&config)?);
//!
//! // Create and start a job
//! let id = manager.create_job(JobConfig {
//!     name: "photos".into(),
//!     source: "/data/photos".into(),
//!     dest: "backup@nas:/srv/photos".into(),
//!     transfer_type: TransferType::Rsync,
//!     settings: JobSettings::default(),
//! })?;
//! manager.start_job(id)?;
//!
//! // Progress flows through the monitor to subscribers
//! let notifier = Arc::new(NotificationChannel::new(config.notify.min_flush_interval));
//! notifier.subscribe_to_updates(|batch| {
//!     for update in batch {
//!         println!("{} {:.1}%", update.job_id, update.percent);
//!     }
//! });
//! let mut monitor = BackgroundMonitor::new(Arc::clone(&manager), notifier, config.monitor.clone());
//! monitor.recover()?;
//! let handle = monitor.spawn()?;
//! # handle.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Job record, settings, progress and state enums
//! - **error**: Error types per layer
//! - **config**: TOML configuration
//! - **manager**: `JobManager`, the orchestrator
//! - **transfer**: `Engine` trait and the rsync/rclone engines
//! - **storage**: Crash-safe job store
//! - **monitor**: Background control loop
//! - **notify**: Batched update notifications
//! - **recovery**: Retry, circuit breaker, graceful degradation
//! - **error_log**: Durable error log
//! - **progress**: Progress snapshots and parsing state
//! - **fs_ops**: Filesystem helpers
//! - **checksums**: Checksums for verification

pub mod checksums;
pub mod config;
pub mod error;
pub mod error_log;
pub mod fs_ops;
pub mod manager;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod progress;
pub mod recovery;
pub mod storage;
pub mod transfer;

// Re-export main types
pub use config::{Config, ConfigError};
pub use error::{EngineError, JobError, StorageError};
pub use error_log::{ErrorEvent, ErrorLog, Severity};
pub use manager::{JobManager, UpdateOutcome};
pub use model::{
    DeletionMode, DeletionPhase, Job, JobConfig, JobId, JobSettings, JobSnapshot, JobStatus, Progress,
    SettingsPatch, TransferType, VerificationMode,
};
pub use monitor::{BackgroundMonitor, HealthStatus, MonitorHandle};
pub use notify::{JobUpdate, NotificationChannel};
pub use progress::{EngineState, ProgressSnapshot};
pub use recovery::{degrade, retry_with_backoff, CircuitBreaker, RetryPolicy};
pub use storage::JobStorage;
pub use transfer::{Engine, EngineFactory, EngineSettings, RcloneEngine, RsyncEngine, ToolEngineFactory};
