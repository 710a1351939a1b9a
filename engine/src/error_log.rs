//! Durable error log.
//!
//! Every error the orchestrator sees, recovered or not, is appended as one
//! JSON line to `errors.jsonl` with its severity and originating component.
//! A bounded in-memory ring keeps recent events for the monitor's health
//! review.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::JobId;

const RECENT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    /// Originating component, e.g. `storage`, `engine.rsync`, `manager`
    pub component: String,
    pub message: String,
    #[serde(default)]
    pub job_id: Option<JobId>,
    /// The owning component handled the failure internally
    #[serde(default)]
    pub recovered: bool,
}

/// Append-only error log shared by all components.
#[derive(Debug)]
pub struct ErrorLog {
    path: Option<PathBuf>,
    // Serialises appends so lines never interleave
    writer: Mutex<()>,
    recent: Mutex<VecDeque<ErrorEvent>>,
}

impl ErrorLog {
    /// Log backed by `path`; the parent directory is created if missing.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(ErrorLog {
            path: Some(path),
            writer: Mutex::new(()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        })
    }

    /// Log that only keeps events in memory.
    pub fn in_memory() -> Self {
        ErrorLog {
            path: None,
            writer: Mutex::new(()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn error(&self, component: &str, job_id: Option<JobId>, message: impl Into<String>) {
        self.record(Severity::Error, component, job_id, message.into(), false);
    }

    pub fn warning(&self, component: &str, job_id: Option<JobId>, message: impl Into<String>) {
        self.record(Severity::Warning, component, job_id, message.into(), false);
    }

    /// A failure the component recovered from on its own.
    pub fn recovered(&self, component: &str, job_id: Option<JobId>, message: impl Into<String>) {
        self.record(Severity::Warning, component, job_id, message.into(), true);
    }

    pub fn critical(&self, component: &str, job_id: Option<JobId>, message: impl Into<String>) {
        self.record(Severity::Critical, component, job_id, message.into(), false);
    }

    fn record(
        &self,
        severity: Severity,
        component: &str,
        job_id: Option<JobId>,
        message: String,
        recovered: bool,
    ) {
        match severity {
            Severity::Info => tracing::info!(component, ?job_id, recovered, "{}", message),
            Severity::Warning => tracing::warn!(component, ?job_id, recovered, "{}", message),
            Severity::Error | Severity::Critical => {
                tracing::error!(component, ?job_id, recovered, ?severity, "{}", message)
            }
        }

        let event = ErrorEvent {
            timestamp: Utc::now(),
            severity,
            component: component.to_string(),
            message,
            job_id,
            recovered,
        };

        if let Some(path) = &self.path {
            if let Err(e) = self.append(path, &event) {
                tracing::warn!(path = %path.display(), error = %e, "could not append to error log");
            }
        }

        let mut recent = self.recent.lock();
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(event);
    }

    fn append(&self, path: &Path, event: &ErrorEvent) -> io::Result<()> {
        let line = serde_json::to_string(event).map_err(io::Error::other)?;
        let _guard = self.writer.lock();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        file.sync_data()
    }

    /// Events recorded within the last `window`, oldest first.
    pub fn recent(&self, window: Duration) -> Vec<ErrorEvent> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        self.recent
            .lock()
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Read every event from a log file, skipping lines that do not parse.
    pub fn read_all(path: &Path) -> io::Result<Vec<ErrorEvent>> {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Ok(event) = serde_json::from_str(&line) {
                events.push(event);
            }
        }
        Ok(events)
    }
}
