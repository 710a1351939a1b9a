//! Transfer engines.
//!
//! An `Engine` supervises the external transfer process of one job:
//! - Spawns the tool and parses its output into progress
//! - Restarts the attempt with exponential backoff on transient network failures
//! - Applies deletion safety (free-space guard, verify then delete, move
//!   semantics, empty directory cleanup)
//!
//! `ToolEngine<T>` implements supervision once; a `TransferTool` supplies
//! the command lines and output parsing that differ between rsync and rclone.

pub mod deletion;
mod process;
pub mod rclone;
pub mod rsync;
pub mod verify;

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use crate::checksums::ChecksumAlgorithm;
use crate::config::{Config, ToolsConfig};
use crate::error::{EngineError, JobError};
use crate::error_log::ErrorLog;
use crate::fs_ops;
use crate::model::{DeletionMode, DeletionPhase, Job, JobConfig, Progress, TransferType, VerificationMode};
use crate::progress::{EngineState, ProgressSnapshot, ProgressTracker, ToolEvent};
use crate::recovery::{degrade, RetryPolicy};

use deletion::SpaceCheck;
use process::{Captured, Exit, ProcessSlot, Stream};
use verify::{VerifyMethod, VerifyReport};

pub use rclone::Rclone;
pub use rsync::Rsync;

/// Supervises rsync transfers.
pub type RsyncEngine = ToolEngine<Rsync>;
/// Supervises rclone transfers.
pub type RcloneEngine = ToolEngine<Rclone>;

/// How long to wait for a killed process to go away.
const KILL_WAIT: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(25);

/// Output fragments that mean the network, not the data, was the problem.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection timed out",
    "operation timed out",
    "i/o timeout",
    "broken pipe",
    "network is unreachable",
    "no route to host",
    "host is unreachable",
    "could not resolve hostname",
    "name or service not known",
    "temporary failure in name resolution",
    "no such host",
    "connection unexpectedly closed",
];

/// Whether a line of tool output describes a transient network failure.
pub fn is_transient_message(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Supervision of one job's transfer process.
///
/// All methods take `&self`; engines are shared between the manager and the
/// monitor. `progress` only copies state and never blocks on process I/O.
pub trait Engine: Send + Sync {
    /// Check tool-specific location syntax.
    fn validate_config(&self, config: &JobConfig) -> Result<(), String>;

    /// Launch the transfer in the background. An engine runs at most once.
    fn start(&self, job: &Job) -> Result<(), EngineError>;

    /// Ask the process to exit, kill it after `grace`, and wait for the
    /// supervisor to finish.
    fn stop(&self, grace: Duration) -> Result<(), EngineError>;

    fn progress(&self) -> ProgressSnapshot;
}

/// Creates engines for the manager and answers questions that need no
/// engine instance.
pub trait EngineFactory: Send + Sync {
    fn validate_config(&self, config: &JobConfig) -> Result<(), String>;

    /// Fail fast when the tool binary cannot be resolved.
    fn preflight(&self, transfer_type: TransferType) -> Result<(), JobError>;

    fn create(&self, job: &Job) -> Arc<dyn Engine>;
}

/// What differs between transfer tools.
pub trait TransferTool: Send + Sync + 'static {
    const KIND: TransferType;
    /// Component tag for logs
    const COMPONENT: &'static str;
    /// Config key holding the binary path, for error messages
    const CONFIG_KEY: &'static str;

    fn binary(tools: &ToolsConfig) -> &Path;

    fn validate_location(location: &str) -> Result<(), String>;

    fn validate_pair(_source: &str, _dest: &str) -> Result<(), String> {
        Ok(())
    }

    /// Arguments for one transfer attempt; `move_files` selects move semantics.
    fn transfer_args(job: &Job, move_files: bool) -> Vec<String>;

    fn parse_line(line: &str) -> Option<ToolEvent>;

    fn is_transient_exit(code: i32) -> bool;

    /// Arguments for a comparison that changes nothing.
    fn verify_args(job: &Job, checksum: bool) -> Vec<String>;

    fn parse_verify(code: Option<i32>, stdout: &str, stderr: &str) -> Result<VerifyReport, String>;

    /// Separator between the entries of a deletion file list.
    const LIST_SEPARATOR: u8;

    /// Arguments moving the files named in `file_list` out of the source.
    /// A listed file that changed since verification is copied again first.
    fn delete_source_args(job: &Job, checksum: bool, file_list: &Path) -> Vec<String>;

    /// Command removing empty directories below a remote source, if possible.
    fn cleanup_command(job: &Job, tools: &ToolsConfig) -> Option<(PathBuf, Vec<String>)>;
}

/// Checks shared by every tool.
pub(crate) fn check_common_location(location: &str) -> Result<(), String> {
    if location.trim().is_empty() {
        return Err("location is empty".to_string());
    }
    if location.starts_with('-') {
        return Err(format!("'{}' would be read as a command-line option", location));
    }
    if location.chars().any(char::is_control) {
        return Err("location contains control characters".to_string());
    }
    Ok(())
}

/// Validate both ends of a job for tool `T`.
pub fn validate_with<T: TransferTool>(config: &JobConfig) -> Result<(), String> {
    T::validate_location(&config.source).map_err(|e| format!("source: {}", e))?;
    T::validate_location(&config.dest).map_err(|e| format!("destination: {}", e))?;
    T::validate_pair(&config.source, &config.dest)
}

/// Engine-wide settings taken from the configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub tools: ToolsConfig,
    pub retry: RetryPolicy,
    /// Extra fraction of the source size required free before deleting
    pub free_space_margin: f64,
    pub checksum: ChecksumAlgorithm,
    pub error_log: Arc<ErrorLog>,
}

impl EngineSettings {
    pub fn from_config(config: &Config, error_log: Arc<ErrorLog>) -> Self {
        EngineSettings {
            tools: config.tools.clone(),
            retry: config.retry,
            free_space_margin: config.deletion.free_space_margin,
            checksum: config.verification.algorithm,
            error_log,
        }
    }
}

/// Builds `RsyncEngine`/`RcloneEngine` according to the job's transfer type.
pub struct ToolEngineFactory {
    settings: Arc<EngineSettings>,
}

impl ToolEngineFactory {
    pub fn new(settings: EngineSettings) -> Self {
        ToolEngineFactory {
            settings: Arc::new(settings),
        }
    }
}

fn preflight_tool<T: TransferTool>(tools: &ToolsConfig) -> Result<(), JobError> {
    let binary = T::binary(tools);
    match fs_ops::find_binary(binary) {
        Some(path) => {
            tracing::debug!(component = T::COMPONENT, path = %path.display(), "tool binary resolved");
            Ok(())
        }
        None => Err(JobError::BinaryMissing {
            binary: binary.display().to_string(),
            hint: format!("install {} or set {} in the config file", T::KIND, T::CONFIG_KEY),
        }),
    }
}

impl EngineFactory for ToolEngineFactory {
    fn validate_config(&self, config: &JobConfig) -> Result<(), String> {
        match config.transfer_type {
            TransferType::Rsync => validate_with::<Rsync>(config),
            TransferType::Rclone => validate_with::<Rclone>(config),
        }
    }

    fn preflight(&self, transfer_type: TransferType) -> Result<(), JobError> {
        match transfer_type {
            TransferType::Rsync => preflight_tool::<Rsync>(&self.settings.tools),
            TransferType::Rclone => preflight_tool::<Rclone>(&self.settings.tools),
        }
    }

    fn create(&self, job: &Job) -> Arc<dyn Engine> {
        match job.transfer_type {
            TransferType::Rsync => Arc::new(RsyncEngine::new(Arc::clone(&self.settings))),
            TransferType::Rclone => Arc::new(RcloneEngine::new(Arc::clone(&self.settings))),
        }
    }
}

/// State shared between an engine handle and its supervisor thread.
struct Shared {
    snapshot: Mutex<ProgressSnapshot>,
    process: ProcessSlot,
}

impl Shared {
    fn publish(&self, tracker: &ProgressTracker) {
        let mut snapshot = self.snapshot.lock();
        snapshot.progress = tracker.progress().clone();
        snapshot.updated_at = Utc::now();
    }

    fn set_attempt(&self, attempt: u32) {
        let mut snapshot = self.snapshot.lock();
        snapshot.attempt = attempt;
        snapshot.updated_at = Utc::now();
    }

    fn finish(&self, state: EngineState, progress: &Progress, error: Option<String>) {
        let mut snapshot = self.snapshot.lock();
        snapshot.state = state;
        snapshot.progress = progress.clone();
        snapshot.error = error;
        snapshot.updated_at = Utc::now();
    }
}

/// Engine driving one external tool.
pub struct ToolEngine<T: TransferTool> {
    settings: Arc<EngineSettings>,
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    tool: PhantomData<fn() -> T>,
}

impl<T: TransferTool> ToolEngine<T> {
    pub fn new(settings: Arc<EngineSettings>) -> Self {
        ToolEngine {
            settings,
            shared: Arc::new(Shared {
                snapshot: Mutex::new(ProgressSnapshot::idle(Progress::default())),
                process: ProcessSlot::new(),
            }),
            supervisor: Mutex::new(None),
            tool: PhantomData,
        }
    }
}

fn wait_until_finished(handle: &JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(STOP_POLL);
    }
    true
}

impl<T: TransferTool> Engine for ToolEngine<T> {
    fn validate_config(&self, config: &JobConfig) -> Result<(), String> {
        validate_with::<T>(config)
    }

    fn start(&self, job: &Job) -> Result<(), EngineError> {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() || self.shared.process.stop_requested() {
            return Err(EngineError::AlreadyStarted);
        }
        if job.transfer_type != T::KIND {
            return Err(EngineError::Process(format!(
                "{} engine cannot run a {} job",
                T::KIND,
                job.transfer_type
            )));
        }

        let run = Supervisor::<T>::new(job.clone(), Arc::clone(&self.settings), Arc::clone(&self.shared));
        {
            let mut snapshot = self.shared.snapshot.lock();
            snapshot.state = EngineState::Running;
            snapshot.progress = run.tracker.progress().clone();
            snapshot.attempt = 1;
            snapshot.error = None;
            snapshot.updated_at = Utc::now();
        }

        let short_id: String = job.id.to_string().chars().take(8).collect();
        let handle = thread::Builder::new()
            .name(format!("shuttle-{}-{}", T::KIND, short_id))
            .spawn(move || run.run())
            .map_err(|source| {
                let mut snapshot = self.shared.snapshot.lock();
                snapshot.state = EngineState::Failed;
                snapshot.error = Some(format!("could not start supervisor thread: {}", source));
                EngineError::Spawn {
                    binary: T::binary(&self.settings.tools).display().to_string(),
                    source,
                }
            })?;
        *supervisor = Some(handle);
        Ok(())
    }

    fn stop(&self, grace: Duration) -> Result<(), EngineError> {
        self.shared.process.request_stop();

        let mut supervisor = self.supervisor.lock();
        let Some(handle) = supervisor.as_ref() else {
            let mut snapshot = self.shared.snapshot.lock();
            if snapshot.state == EngineState::Idle {
                snapshot.state = EngineState::Stopped;
            }
            return Ok(());
        };

        if !handle.is_finished() {
            self.shared.process.terminate();
            if !wait_until_finished(handle, grace) {
                let pid = self.shared.process.pid();
                tracing::warn!(
                    component = T::COMPONENT,
                    ?pid,
                    grace_ms = grace.as_millis() as u64,
                    "process ignored SIGTERM, killing"
                );
                self.shared.process.kill();
                if !wait_until_finished(handle, KILL_WAIT) {
                    return Err(EngineError::NotStoppable {
                        pid: pid.unwrap_or_default(),
                    });
                }
            }
        }

        if let Some(handle) = supervisor.take() {
            if handle.join().is_err() {
                tracing::error!(component = T::COMPONENT, "supervisor thread panicked");
            }
        }
        Ok(())
    }

    fn progress(&self) -> ProgressSnapshot {
        self.shared.snapshot.lock().clone()
    }
}

enum Finish {
    /// Carries a note for the job record, e.g. a failed verification
    Completed(Option<String>),
    Stopped,
}

/// Outcome of a step that a stop request can interrupt.
enum Step<T> {
    Done(T),
    Stopped,
}

enum Attempt {
    Success,
    Stopped,
    Transient(String),
    Fatal(String),
}

/// Runs on the engine's own thread for the lifetime of one start.
struct Supervisor<T: TransferTool> {
    job: Job,
    settings: Arc<EngineSettings>,
    shared: Arc<Shared>,
    tracker: ProgressTracker,
    tool: PhantomData<fn() -> T>,
}

impl<T: TransferTool> Supervisor<T> {
    fn new(job: Job, settings: Arc<EngineSettings>, shared: Arc<Shared>) -> Self {
        let move_files =
            job.settings.deletion_enabled && job.settings.deletion_mode == DeletionMode::PerFile;
        let tracker = ProgressTracker::new(&job.progress, move_files);
        Supervisor {
            job,
            settings,
            shared,
            tracker,
            tool: PhantomData,
        }
    }

    fn moves_files(&self) -> bool {
        self.job.settings.deletion_enabled && self.job.settings.deletion_mode == DeletionMode::PerFile
    }

    fn publish(&self) {
        self.shared.publish(&self.tracker);
    }

    fn set_phase(&mut self, phase: DeletionPhase) {
        tracing::debug!(component = T::COMPONENT, job_id = %self.job.id, %phase, "deletion phase");
        self.tracker.set_phase(phase);
        self.publish();
    }

    fn run(mut self) {
        let started = Instant::now();
        tracing::info!(
            component = T::COMPONENT,
            job_id = %self.job.id,
            source = %self.job.source,
            dest = %self.job.dest,
            "transfer started"
        );

        let (state, error) = match self.execute() {
            Ok(Finish::Completed(note)) => {
                tracing::info!(
                    component = T::COMPONENT,
                    job_id = %self.job.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    files = self.tracker.progress().files_transferred,
                    "transfer completed"
                );
                (EngineState::Completed, note)
            }
            Ok(Finish::Stopped) => {
                tracing::info!(component = T::COMPONENT, job_id = %self.job.id, "transfer stopped");
                (EngineState::Stopped, None)
            }
            Err(message) => {
                let phase = self.tracker.progress().deletion.phase;
                if self.job.settings.deletion_enabled
                    && !matches!(phase, DeletionPhase::Done | DeletionPhase::Skipped | DeletionPhase::Failed)
                {
                    self.tracker.set_phase(DeletionPhase::Failed);
                }
                self.settings.error_log.error(T::COMPONENT, Some(self.job.id), message.clone());
                (EngineState::Failed, Some(message))
            }
        };
        self.shared.finish(state, self.tracker.progress(), error);
    }

    fn execute(&mut self) -> Result<Finish, String> {
        let deletion = self.job.settings.deletion_enabled;
        if deletion {
            self.set_phase(DeletionPhase::Transferring);
            self.guard_free_space()?;
        }

        if let Step::Stopped = self.transfer()? {
            return Ok(Finish::Stopped);
        }
        self.tracker.finish_transfer();
        self.publish();

        let verify_after = self.job.settings.verification_mode == VerificationMode::VerifyAfter;
        let note = match (deletion, self.job.settings.deletion_mode) {
            (true, DeletionMode::VerifyThenDelete) => match self.verify_then_delete()? {
                Step::Done(note) => note,
                Step::Stopped => return Ok(Finish::Stopped),
            },
            (true, DeletionMode::PerFile) => {
                // Whatever is left in the source was not moved
                let note = if verify_after {
                    match self.verify_and_record() {
                        Step::Done(outcome) => outcome.err(),
                        Step::Stopped => return Ok(Finish::Stopped),
                    }
                } else {
                    None
                };
                if let Step::Stopped = self.cleanup() {
                    return Ok(Finish::Stopped);
                }
                note
            }
            (false, _) if verify_after => match self.verify_and_record() {
                Step::Done(outcome) => outcome.err(),
                Step::Stopped => return Ok(Finish::Stopped),
            },
            (false, _) => None,
        };
        Ok(Finish::Completed(note))
    }

    fn guard_free_space(&self) -> Result<(), String> {
        match deletion::check_free_space(&self.job, self.settings.free_space_margin) {
            Ok(SpaceCheck::Sufficient { needed, available }) => {
                tracing::debug!(component = T::COMPONENT, job_id = %self.job.id, needed, available, "free space check passed");
                Ok(())
            }
            Ok(SpaceCheck::Skipped(reason)) => {
                self.settings.error_log.warning(
                    T::COMPONENT,
                    Some(self.job.id),
                    format!("free space check skipped: {}", reason),
                );
                Ok(())
            }
            Err(e) => Err(format!("free space check failed: {}", e)),
        }
    }

    fn transfer(&mut self) -> Result<Step<()>, String> {
        let policy = self.settings.retry;
        let mut attempt = 1;
        loop {
            self.shared.set_attempt(attempt);
            match self.run_attempt() {
                Attempt::Success => return Ok(Step::Done(())),
                Attempt::Stopped => return Ok(Step::Stopped),
                Attempt::Fatal(message) => return Err(message),
                Attempt::Transient(message) => {
                    if attempt >= policy.max_attempts {
                        return Err(format!("giving up after {} attempts: {}", attempt, message));
                    }
                    let delay = policy.delay_for(attempt);
                    self.settings.error_log.recovered(
                        T::COMPONENT,
                        Some(self.job.id),
                        format!(
                            "attempt {} hit a transient failure, retrying in {:.1}s: {}",
                            attempt,
                            delay.as_secs_f64(),
                            message
                        ),
                    );
                    if !self.shared.process.sleep(delay) {
                        return Ok(Step::Stopped);
                    }
                    attempt += 1;
                    self.tracker.begin_attempt();
                    self.publish();
                }
            }
        }
    }

    fn run_attempt(&mut self) -> Attempt {
        let mut cmd = Command::new(T::binary(&self.settings.tools));
        cmd.args(T::transfer_args(&self.job, self.moves_files()));

        let job_id = self.job.id;
        let mut last_error: Option<String> = None;
        let mut saw_transient = false;
        let tracker = &mut self.tracker;
        let shared = &self.shared;
        let exit = shared.process.run_streaming(T::COMPONENT, &mut cmd, |line| {
            match T::parse_line(&line.text) {
                Some(ToolEvent::Error(message)) => {
                    saw_transient |= is_transient_message(&message);
                    last_error = Some(message);
                }
                Some(event) => {
                    tracker.apply(&event);
                    shared.publish(tracker);
                }
                None if line.stream == Stream::Stderr => {
                    saw_transient |= is_transient_message(&line.text);
                    last_error = Some(line.text);
                }
                None => {
                    tracing::trace!(component = T::COMPONENT, %job_id, line = %line.text, "unparsed output");
                }
            }
        });

        match exit {
            Err(e) => Attempt::Fatal(e.to_string()),
            Ok(Exit::Stopped) => Attempt::Stopped,
            Ok(Exit::Status(status)) if status.success() => Attempt::Success,
            Ok(Exit::Status(status)) => {
                let detail = last_error.unwrap_or_else(|| "no error output".to_string());
                let message = match status.code() {
                    Some(code) => format!("{} exited with code {}: {}", T::KIND, code, detail),
                    None => format!("{} was terminated by a signal: {}", T::KIND, detail),
                };
                if saw_transient || status.code().map_or(false, T::is_transient_exit) {
                    Attempt::Transient(message)
                } else {
                    Attempt::Fatal(message)
                }
            }
        }
    }

    fn verify(&mut self) -> Result<Step<VerifyReport>, String> {
        let method = VerifyMethod::for_mode(self.job.settings.verification_mode, self.settings.checksum);

        if !fs_ops::is_remote(&self.job.source) && !fs_ops::is_remote(&self.job.dest) {
            let process = &self.shared.process;
            let should_stop = || process.stop_requested();
            return match verify::verify_local(
                Path::new(&self.job.source),
                Path::new(&self.job.dest),
                method,
                &should_stop,
            ) {
                Ok(Some(report)) => Ok(Step::Done(report)),
                Ok(None) => Ok(Step::Stopped),
                Err(e) => Err(e.to_string()),
            };
        }

        let mut cmd = Command::new(T::binary(&self.settings.tools));
        cmd.args(T::verify_args(&self.job, method.uses_checksum()));
        let captured = self
            .shared
            .process
            .run_captured(T::COMPONENT, &mut cmd)
            .map_err(|e| e.to_string())?;
        match captured.exit {
            Exit::Stopped => Ok(Step::Stopped),
            Exit::Status(status) => {
                T::parse_verify(status.code(), &captured.stdout, &captured.stderr).map(Step::Done)
            }
        }
    }

    /// Run a verification pass and record it. A failed or impossible pass
    /// yields the note for the job record.
    fn verify_and_record(&mut self) -> Step<Result<VerifyReport, String>> {
        match self.verify() {
            Ok(Step::Stopped) => Step::Stopped,
            Ok(Step::Done(report)) => {
                report.apply_to(&mut self.tracker.progress_mut().verification);
                self.publish();
                if report.passed() {
                    tracing::info!(
                        component = T::COMPONENT,
                        job_id = %self.job.id,
                        files_checked = report.files_checked,
                        "verification passed"
                    );
                    Step::Done(Ok(report))
                } else {
                    let summary = report.summary();
                    self.settings.error_log.warning(T::COMPONENT, Some(self.job.id), summary.clone());
                    Step::Done(Err(summary))
                }
            }
            Err(message) => {
                self.tracker.progress_mut().verification.passed = Some(false);
                self.publish();
                let note = format!("verification could not run: {}", message);
                self.settings.error_log.error(T::COMPONENT, Some(self.job.id), note.clone());
                Step::Done(Err(note))
            }
        }
    }

    fn verify_then_delete(&mut self) -> Result<Step<Option<String>>, String> {
        self.set_phase(DeletionPhase::Verifying);
        let report = match self.verify_and_record() {
            Step::Done(Ok(report)) => report,
            Step::Done(Err(note)) => {
                self.set_phase(DeletionPhase::Skipped);
                tracing::warn!(component = T::COMPONENT, job_id = %self.job.id, "deletion skipped, source left in place");
                return Ok(Step::Done(Some(format!("{}; source left in place", note))));
            }
            Step::Stopped => return Ok(Step::Stopped),
        };

        self.set_phase(DeletionPhase::Deleting);
        match self.delete_source(&report) {
            Ok(Step::Done(())) => {}
            Ok(Step::Stopped) => return Ok(Step::Stopped),
            Err(message) => {
                self.set_phase(DeletionPhase::Failed);
                return Err(format!("deleting source failed: {}", message));
            }
        }

        match self.cleanup() {
            Step::Done(()) => Ok(Step::Done(None)),
            Step::Stopped => Ok(Step::Stopped),
        }
    }

    /// Remove the files `report` verified, and only those.
    fn delete_source(&mut self, report: &VerifyReport) -> Result<Step<()>, String> {
        let unlisted = report.files_checked.saturating_sub(report.verified.len() as u64);
        if unlisted > 0 {
            self.settings.error_log.warning(
                T::COMPONENT,
                Some(self.job.id),
                format!("{} checked files were not individually confirmed and stay in the source", unlisted),
            );
        }
        if report.verified.is_empty() {
            return Ok(Step::Done(()));
        }

        if !fs_ops::is_remote(&self.job.source) && !fs_ops::is_remote(&self.job.dest) {
            let process = &self.shared.process;
            let should_stop = || process.stop_requested();
            let removal =
                match deletion::delete_local_source(Path::new(&self.job.source), &report.verified, &should_stop) {
                    Ok(Some(removal)) => removal,
                    Ok(None) => return Ok(Step::Stopped),
                    Err(e) => return Err(e.to_string()),
                };
            if !removal.kept.is_empty() {
                let shown: Vec<String> = removal
                    .kept
                    .iter()
                    .take(5)
                    .map(|path| path.display().to_string())
                    .collect();
                self.settings.error_log.warning(
                    T::COMPONENT,
                    Some(self.job.id),
                    format!(
                        "{} files changed after verification and stay in the source: {}",
                        removal.kept.len(),
                        shown.join(", ")
                    ),
                );
            }
            tracing::info!(
                component = T::COMPONENT,
                job_id = %self.job.id,
                files = removal.files,
                bytes = removal.bytes,
                "source files deleted"
            );
            self.tracker.add_deleted(removal.files, removal.bytes);
            self.publish();
            return Ok(Step::Done(()));
        }

        let file_list =
            deletion::write_file_list(&report.verified, T::LIST_SEPARATOR).map_err(|e| e.to_string())?;
        let checksum = self.job.settings.verification_mode != VerificationMode::Fast;
        let mut cmd = Command::new(T::binary(&self.settings.tools));
        cmd.args(T::delete_source_args(&self.job, checksum, file_list.path()));
        let captured = self
            .shared
            .process
            .run_captured(T::COMPONENT, &mut cmd)
            .map_err(|e| e.to_string())?;
        match captured.exit {
            Exit::Stopped => Ok(Step::Stopped),
            Exit::Status(status) if status.success() => {
                // The tools do not report sizes here; prorate the transfer total
                let files = report.verified.len() as u64;
                let total_bytes = self.tracker.progress().total_bytes;
                let bytes = if files >= report.files_checked {
                    total_bytes
                } else {
                    (total_bytes as f64 * files as f64 / report.files_checked as f64) as u64
                };
                self.tracker.add_deleted(files, bytes);
                self.publish();
                Ok(Step::Done(()))
            }
            Exit::Status(status) => Err(format!(
                "{} exited with {}: {}",
                T::KIND,
                status,
                captured.stderr.lines().last().unwrap_or("no error output")
            )),
        }
    }

    /// Remove empty directories left in the source. Failures only warn.
    fn cleanup(&mut self) -> Step<()> {
        self.set_phase(DeletionPhase::Cleanup);

        if !fs_ops::is_remote(&self.job.source) {
            let source = Path::new(&self.job.source);
            let removed = degrade(T::COMPONENT, 0, || fs_ops::remove_empty_dirs(source));
            tracing::debug!(component = T::COMPONENT, job_id = %self.job.id, removed, "removed empty source directories");
        } else {
            match T::cleanup_command(&self.job, &self.settings.tools) {
                Some((binary, args)) => {
                    let mut cmd = Command::new(&binary);
                    cmd.args(&args);
                    match self.shared.process.run_captured(T::COMPONENT, &mut cmd) {
                        Ok(Captured { exit: Exit::Stopped, .. }) => return Step::Stopped,
                        Ok(Captured {
                            exit: Exit::Status(status),
                            stderr,
                            ..
                        }) if !status.success() => {
                            self.settings.error_log.warning(
                                T::COMPONENT,
                                Some(self.job.id),
                                format!(
                                    "empty directory cleanup on {} failed ({}): {}",
                                    self.job.source,
                                    status,
                                    stderr.lines().last().unwrap_or("no error output")
                                ),
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            self.settings.error_log.warning(
                                T::COMPONENT,
                                Some(self.job.id),
                                format!("empty directory cleanup on {} failed: {}", self.job.source, e),
                            );
                        }
                    }
                }
                None => {
                    self.settings.error_log.warning(
                        T::COMPONENT,
                        Some(self.job.id),
                        format!("cannot remove empty directories on {}", self.job.source),
                    );
                }
            }
        }

        self.set_phase(DeletionPhase::Done);
        Step::Done(())
    }
}

impl<T: TransferTool> Drop for Supervisor<T> {
    fn drop(&mut self) {
        // Only reached while still running if the supervisor panicked
        let mut snapshot = self.shared.snapshot.lock();
        if snapshot.state == EngineState::Running {
            snapshot.state = EngineState::Failed;
            snapshot.error = Some("transfer supervisor exited unexpectedly".to_string());
        }
    }
}
