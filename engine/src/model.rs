//! Core data model for transfer jobs.
//!
//! This module defines the persisted job record and everything hanging off it:
//! - Job: one supervised transfer between a source and a destination
//! - Progress, DeletionProgress, VerificationProgress: live counters
//! - JobSettings, JobConfig, SettingsPatch: user supplied configuration
//! - JobStatus, TransferType, DeletionMode, VerificationMode, DeletionPhase: enums

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a job. Opaque to callers, immutable after creation.
pub type JobId = Uuid;

/// Immutable copy of a job handed out by the read-only API.
///
/// Snapshots are owned clones taken under the job-map lock; mutating one
/// never affects the manager's state.
pub type JobSnapshot = Job;

/// Represents a single supervised transfer job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job
    pub id: JobId,

    /// Human readable label
    pub name: String,

    /// Source location (local path or tool-specific remote spec)
    pub source: String,

    /// Destination location (local path or tool-specific remote spec)
    pub dest: String,

    /// External tool that performs the transfer
    pub transfer_type: TransferType,

    /// Current position in the job state machine
    pub status: JobStatus,

    /// Last progress pulled from the engine
    pub progress: Progress,

    /// Mutable user settings
    pub settings: JobSettings,

    /// Incremented on every persisted mutation
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// When the most recent run started
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// When the most recent run reached a terminal state
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    /// Last failure message, cleared on restart
    #[serde(default)]
    pub error: Option<String>,

    /// Process restarts performed by the engine during the last run
    #[serde(default)]
    pub attempts: u32,
}

impl Job {
    /// Build a fresh pending job from a validated configuration.
    pub fn from_config(config: JobConfig, now: DateTime<Utc>) -> Self {
        let progress = Progress {
            deletion: DeletionProgress {
                enabled: config.settings.deletion_enabled,
                mode: config.settings.deletion_mode,
                phase: if config.settings.deletion_enabled {
                    DeletionPhase::Waiting
                } else {
                    DeletionPhase::None
                },
                ..DeletionProgress::default()
            },
            ..Progress::default()
        };

        Job {
            id: Uuid::new_v4(),
            name: config.name,
            source: config.source,
            dest: config.dest,
            transfer_type: config.transfer_type,
            status: JobStatus::Pending,
            progress,
            settings: config.settings,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            error: None,
            attempts: 0,
        }
    }

    /// Whether the job is currently allowed to enter `Running`.
    pub fn is_startable(&self) -> bool {
        self.status.can_transition_to(JobStatus::Running)
    }
}

/// Input for `JobManager::create_job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub source: String,
    pub dest: String,
    pub transfer_type: TransferType,
    #[serde(default)]
    pub settings: JobSettings,
}

/// User settings attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    /// Bandwidth cap in KiB/s, passed to the tool as `--bwlimit`
    #[serde(default)]
    pub bandwidth_limit: Option<u64>,

    /// Delete source files once they are safely at the destination
    #[serde(default)]
    pub deletion_enabled: bool,

    #[serde(default)]
    pub deletion_mode: DeletionMode,

    /// Explicit user acknowledgement that source data will be removed
    #[serde(default)]
    pub deletion_confirmed: bool,

    #[serde(default)]
    pub verification_mode: VerificationMode,
}

impl Default for JobSettings {
    fn default() -> Self {
        JobSettings {
            bandwidth_limit: None,
            deletion_enabled: false,
            deletion_mode: DeletionMode::VerifyThenDelete,
            deletion_confirmed: false,
            verification_mode: VerificationMode::Fast,
        }
    }
}

/// Partial update for the mutable settings of a job.
///
/// Deletion settings are fixed at creation so the confirmation rule cannot
/// be bypassed afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPatch {
    /// `Some(None)` clears the limit
    pub bandwidth_limit: Option<Option<u64>>,
    pub verification_mode: Option<VerificationMode>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.bandwidth_limit.is_none() && self.verification_mode.is_none()
    }

    /// Apply the patch, returning true when anything changed.
    pub fn apply(&self, settings: &mut JobSettings) -> bool {
        let mut changed = false;
        if let Some(limit) = self.bandwidth_limit {
            changed |= settings.bandwidth_limit != limit;
            settings.bandwidth_limit = limit;
        }
        if let Some(mode) = self.verification_mode {
            changed |= settings.verification_mode != mode;
            settings.verification_mode = mode;
        }
        changed
    }
}

/// Progress counters for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// 0.0 ..= 100.0
    pub percent: f64,
    /// Bytes per second
    pub speed: f64,
    pub eta_seconds: Option<u64>,
    #[serde(default)]
    pub files_transferred: u64,
    pub deletion: DeletionProgress,
    pub verification: VerificationProgress,
}

impl Progress {
    /// Fill `total_bytes` from the percentage when the tool only reports a ratio.
    pub fn estimate_total(&mut self) {
        if self.total_bytes == 0 && self.percent > 0.0 {
            self.total_bytes = (self.bytes_transferred as f64 * 100.0 / self.percent).round() as u64;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletionProgress {
    pub enabled: bool,
    pub mode: DeletionMode,
    pub phase: DeletionPhase,
    pub files_deleted: u64,
    pub bytes_deleted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationProgress {
    /// `None` until a verification pass has run
    pub passed: Option<bool>,
    pub files_checked: u64,
    pub mismatches: u64,
}

/// The external tool driving a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Rsync,
    Rclone,
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferType::Rsync => write!(f, "rsync"),
            TransferType::Rclone => write!(f, "rclone"),
        }
    }
}

impl FromStr for TransferType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rsync" => Ok(TransferType::Rsync),
            "rclone" => Ok(TransferType::Rclone),
            other => Err(format!("unknown transfer type '{}'; expected 'rsync' or 'rclone'", other)),
        }
    }
}

/// The state of a job.
///
/// ```text
/// pending -> running -> {paused, completed, failed}
/// paused  -> running
/// failed  -> running      (manual retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    /// Returns true for states the monitor stops polling.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Failed, Running)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How source files are removed once deletion is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionMode {
    /// Transfer everything, verify, then delete the source
    #[default]
    VerifyThenDelete,
    /// Move semantics: each file is deleted right after its own transfer
    PerFile,
}

impl FromStr for DeletionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "verify_then_delete" => Ok(DeletionMode::VerifyThenDelete),
            "per_file" => Ok(DeletionMode::PerFile),
            other => Err(format!(
                "unknown deletion mode '{}'; expected 'verify_then_delete' or 'per_file'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    /// Size and modification time
    #[default]
    Fast,
    /// Content checksums, also passed to the tool as `--checksum`
    Checksum,
    /// Checksum pass after every successful transfer, deletion or not
    VerifyAfter,
}

impl FromStr for VerificationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fast" => Ok(VerificationMode::Fast),
            "checksum" => Ok(VerificationMode::Checksum),
            "verify_after" => Ok(VerificationMode::VerifyAfter),
            other => Err(format!(
                "unknown verification mode '{}'; expected 'fast', 'checksum' or 'verify_after'",
                other
            )),
        }
    }
}

/// Where a job is in its deletion workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPhase {
    /// Deletion disabled
    #[default]
    None,
    Waiting,
    Transferring,
    Verifying,
    Deleting,
    Cleanup,
    Done,
    /// Verification failed; source left untouched
    Skipped,
    Failed,
}

impl fmt::Display for DeletionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeletionPhase::None => "none",
            DeletionPhase::Waiting => "waiting",
            DeletionPhase::Transferring => "transferring",
            DeletionPhase::Verifying => "verifying",
            DeletionPhase::Deleting => "deleting",
            DeletionPhase::Cleanup => "cleanup",
            DeletionPhase::Done => "done",
            DeletionPhase::Skipped => "skipped",
            DeletionPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> JobConfig {
        JobConfig {
            name: "photos".to_string(),
            source: "/data/photos".to_string(),
            dest: "/backup/photos".to_string(),
            transfer_type: TransferType::Rsync,
            settings: JobSettings::default(),
        }
    }

    #[test]
    fn test_state_machine_edges() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Paused.can_transition_to(Running));
        assert!(Failed.can_transition_to(Running));

        assert!(!Completed.can_transition_to(Running), "completed is terminal");
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_new_job_starts_pending_at_version_zero() {
        let job = Job::from_config(config(), Utc::now());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.version, 0);
        assert_eq!(job.progress.deletion.phase, DeletionPhase::None);
        assert!(job.is_startable());
    }

    #[test]
    fn test_deletion_enabled_job_waits() {
        let mut cfg = config();
        cfg.settings.deletion_enabled = true;
        cfg.settings.deletion_confirmed = true;
        cfg.settings.deletion_mode = DeletionMode::PerFile;

        let job = Job::from_config(cfg, Utc::now());
        assert!(job.progress.deletion.enabled);
        assert_eq!(job.progress.deletion.mode, DeletionMode::PerFile);
        assert_eq!(job.progress.deletion.phase, DeletionPhase::Waiting);
    }

    #[test]
    fn test_estimate_total_from_percent() {
        let mut progress = Progress {
            bytes_transferred: 250,
            percent: 25.0,
            ..Progress::default()
        };
        progress.estimate_total();
        assert_eq!(progress.total_bytes, 1000);

        // A reported total is never overwritten
        let mut progress = Progress {
            bytes_transferred: 250,
            total_bytes: 900,
            percent: 25.0,
            ..Progress::default()
        };
        progress.estimate_total();
        assert_eq!(progress.total_bytes, 900);

        // Zero percent leaves the total unknown
        let mut progress = Progress {
            bytes_transferred: 10,
            ..Progress::default()
        };
        progress.estimate_total();
        assert_eq!(progress.total_bytes, 0);
    }

    #[test]
    fn test_settings_patch_reports_changes() {
        let mut settings = JobSettings::default();
        let patch = SettingsPatch {
            bandwidth_limit: Some(Some(512)),
            verification_mode: Some(VerificationMode::Fast),
        };
        assert!(patch.apply(&mut settings));
        assert_eq!(settings.bandwidth_limit, Some(512));
        assert!(!patch.apply(&mut settings), "second application changes nothing");
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("RSYNC".parse::<TransferType>(), Ok(TransferType::Rsync));
        assert_eq!("per-file".parse::<DeletionMode>(), Ok(DeletionMode::PerFile));
        assert_eq!("verify_after".parse::<VerificationMode>(), Ok(VerificationMode::VerifyAfter));
        assert!("scp".parse::<TransferType>().is_err());
    }

    #[test]
    fn test_job_json_uses_lowercase_enums() {
        let job = Job::from_config(config(), Utc::now());
        let json = serde_json::to_value(&job).expect("serialize job");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["transfer_type"], "rsync");
        assert_eq!(json["settings"]["deletion_mode"], "verify_then_delete");
    }
}
