//! Progress reporting between transfer engines and the manager.
//!
//! Engines parse tool output into `ToolEvent`s and fold them into a
//! `ProgressTracker`. The manager never talks to the process; it pulls a
//! `ProgressSnapshot` copy, so readers are decoupled from process I/O.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::model::{DeletionPhase, Progress};

/// Lifecycle of one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, not started
    Idle,
    Running,
    /// Transfer (and any verification/deletion) finished successfully
    Completed,
    Failed,
    /// Stopped on request; the job will be paused or deleted
    Stopped,
}

impl EngineState {
    /// No process is or will be running for this engine.
    pub fn is_finished(&self) -> bool {
        matches!(self, EngineState::Completed | EngineState::Failed | EngineState::Stopped)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Completed => "completed",
            EngineState::Failed => "failed",
            EngineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Point-in-time copy of an engine's state.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub state: EngineState,
    pub progress: Progress,
    /// 1-based attempt currently (or last) running
    pub attempt: u32,
    /// Failure message, or a note such as a failed verification
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn idle(progress: Progress) -> Self {
        ProgressSnapshot {
            state: EngineState::Idle,
            progress,
            attempt: 0,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Restarts performed so far.
    pub fn restarts(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }
}

/// Cumulative statistics reported by a tool for the current attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    pub bytes: u64,
    pub total_bytes: Option<u64>,
    pub percent: Option<f64>,
    /// Bytes per second
    pub speed: f64,
    pub eta_seconds: Option<u64>,
    /// Files transferred so far in this attempt
    pub transfers: Option<u64>,
    /// Source files deleted so far in this attempt
    pub deletes: Option<u64>,
}

/// One meaningful line of tool output.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    Stats(TransferStats),
    /// A single file finished transferring
    FileTransferred { name: String, size: u64 },
    /// The tool reported an error
    Error(String),
    /// Recognised but irrelevant
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Counters {
    files_transferred: u64,
    files_deleted: u64,
    bytes_deleted: u64,
}

/// Folds tool events into `Progress`, carrying counters across restarts.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    progress: Progress,
    carried: Counters,
    attempt: Counters,
    move_semantics: bool,
}

impl ProgressTracker {
    /// Start from the job's persisted progress so deletion counters from an
    /// earlier run keep accumulating.
    pub fn new(initial: &Progress, move_semantics: bool) -> Self {
        let mut progress = initial.clone();
        progress.bytes_transferred = 0;
        progress.total_bytes = 0;
        progress.percent = 0.0;
        progress.speed = 0.0;
        progress.eta_seconds = None;
        progress.verification = Default::default();

        ProgressTracker {
            carried: Counters {
                files_transferred: initial.files_transferred,
                files_deleted: initial.deletion.files_deleted,
                bytes_deleted: initial.deletion.bytes_deleted,
            },
            attempt: Counters::default(),
            progress,
            move_semantics,
        }
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn progress_mut(&mut self) -> &mut Progress {
        &mut self.progress
    }

    pub fn set_phase(&mut self, phase: DeletionPhase) {
        self.progress.deletion.phase = phase;
    }

    /// Close the current attempt. Counters so far are kept; rates reset.
    pub fn begin_attempt(&mut self) {
        self.carried.files_transferred += self.attempt.files_transferred;
        self.carried.files_deleted += self.attempt.files_deleted;
        self.carried.bytes_deleted += self.attempt.bytes_deleted;
        self.attempt = Counters::default();

        self.progress.bytes_transferred = 0;
        self.progress.total_bytes = 0;
        self.progress.percent = 0.0;
        self.progress.speed = 0.0;
        self.progress.eta_seconds = None;
    }

    /// Record source files removed outside the transfer itself.
    pub fn add_deleted(&mut self, files: u64, bytes: u64) {
        self.carried.files_deleted += files;
        self.carried.bytes_deleted += bytes;
        self.sync_counters();
    }

    /// Mark the transfer as fully done.
    pub fn finish_transfer(&mut self) {
        if self.progress.total_bytes < self.progress.bytes_transferred {
            self.progress.total_bytes = self.progress.bytes_transferred;
        }
        self.progress.percent = 100.0;
        self.progress.speed = 0.0;
        self.progress.eta_seconds = Some(0);
    }

    pub fn apply(&mut self, event: &ToolEvent) {
        match event {
            ToolEvent::Stats(stats) => {
                let progress = &mut self.progress;
                progress.bytes_transferred = stats.bytes;
                progress.speed = stats.speed;
                progress.eta_seconds = stats.eta_seconds;
                progress.total_bytes = stats.total_bytes.unwrap_or(0);
                progress.percent = match stats.percent {
                    Some(p) => p,
                    None if progress.total_bytes > 0 => {
                        stats.bytes as f64 * 100.0 / progress.total_bytes as f64
                    }
                    None => progress.percent,
                }
                .clamp(0.0, 100.0);
                progress.estimate_total();

                if let Some(transfers) = stats.transfers {
                    self.attempt.files_transferred = self.attempt.files_transferred.max(transfers);
                }
                if self.move_semantics {
                    if let Some(deletes) = stats.deletes {
                        self.attempt.files_deleted = self.attempt.files_deleted.max(deletes);
                        self.attempt.bytes_deleted = self.attempt.bytes_deleted.max(stats.bytes);
                    }
                }
            }
            ToolEvent::FileTransferred { size, .. } => {
                self.attempt.files_transferred += 1;
                if self.move_semantics {
                    self.attempt.files_deleted += 1;
                    self.attempt.bytes_deleted += size;
                }
            }
            ToolEvent::Error(_) | ToolEvent::Other => {}
        }
        self.sync_counters();
    }

    fn sync_counters(&mut self) {
        self.progress.files_transferred = self.carried.files_transferred + self.attempt.files_transferred;
        self.progress.deletion.files_deleted = self.carried.files_deleted + self.attempt.files_deleted;
        self.progress.deletion.bytes_deleted = self.carried.bytes_deleted + self.attempt.bytes_deleted;
    }
}
