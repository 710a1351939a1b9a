//! The child process behind an engine.
//!
//! Every external command an engine runs (the transfer itself, remote
//! verification, remote deletion and cleanup) goes through one
//! `ProcessSlot`, so a stop request always reaches whatever is running.

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::EngineError;
use crate::recovery::{retry_with_backoff, RetryPolicy};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub(crate) struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

#[derive(Debug)]
pub(crate) enum Exit {
    Status(ExitStatus),
    /// A stop was requested before or while the command ran
    Stopped,
}

/// Output of a command run to completion.
#[derive(Debug)]
pub(crate) struct Captured {
    pub exit: Exit,
    pub stdout: String,
    pub stderr: String,
}

pub(crate) struct ProcessSlot {
    child: Mutex<Option<Child>>,
    stop_requested: AtomicBool,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl ProcessSlot {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        ProcessSlot {
            child: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            stop_tx,
            stop_rx,
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Flag the stop and wake any backoff sleep. Does not signal the child.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.try_send(());
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().map(Child::id)
    }

    /// Ask the running child to exit.
    pub fn terminate(&self) {
        #[cfg(unix)]
        {
            // The slot is cleared once the child is reaped, so the pid is never reused here
            let guard = self.child.lock();
            if let Some(child) = guard.as_ref() {
                let pid = child.id() as libc::pid_t;
                let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
                if rc != 0 {
                    tracing::warn!(pid, error = %io::Error::last_os_error(), "failed to send SIGTERM");
                }
            }
        }
        #[cfg(not(unix))]
        self.kill();
    }

    /// Forcefully kill the running child.
    pub fn kill(&self) {
        if let Some(child) = self.child.lock().as_mut() {
            if let Err(e) = child.kill() {
                tracing::warn!(pid = child.id(), error = %e, "failed to kill process");
            }
        }
    }

    /// Sleep for `delay` unless a stop arrives. Returns false when interrupted.
    pub fn sleep(&self, delay: Duration) -> bool {
        if self.stop_requested() {
            return false;
        }
        match self.stop_rx.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => !self.stop_requested(),
            _ => false,
        }
    }

    /// Run `cmd`, handing every output line to `on_line` as it arrives.
    ///
    /// Lines are split on both `\n` and `\r` so in-place progress updates
    /// are seen individually.
    pub fn run_streaming<F>(&self, label: &str, cmd: &mut Command, mut on_line: F) -> Result<Exit, EngineError>
    where
        F: FnMut(OutputLine),
    {
        let lines = match self.spawn(label, cmd)? {
            Some(lines) => lines,
            None => return Ok(Exit::Stopped),
        };

        let status = loop {
            match lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) => on_line(line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(POLL_INTERVAL),
            }
            if let Some(status) = self.try_wait(label)? {
                break status;
            }
        };

        // Readers finish at EOF; a lingering grandchild may hold the pipes,
        // so only wait briefly for the tail.
        while let Ok(line) = lines.recv_timeout(DRAIN_TIMEOUT) {
            on_line(line);
        }

        if !status.success() && self.stop_requested() {
            return Ok(Exit::Stopped);
        }
        Ok(Exit::Status(status))
    }

    /// Run `cmd` to completion and collect its output.
    pub fn run_captured(&self, label: &str, cmd: &mut Command) -> Result<Captured, EngineError> {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let exit = self.run_streaming(label, cmd, |line| {
            let buf = match line.stream {
                Stream::Stdout => &mut stdout,
                Stream::Stderr => &mut stderr,
            };
            buf.push_str(&line.text);
            buf.push('\n');
        })?;
        Ok(Captured { exit, stdout, stderr })
    }

    fn spawn(&self, label: &str, cmd: &mut Command) -> Result<Option<Receiver<OutputLine>>, EngineError> {
        let mut guard = self.child.lock();
        if self.stop_requested() {
            return Ok(None);
        }

        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        // A binary that is being replaced reports ETXTBSY for a moment
        let policy = RetryPolicy::new(5, Duration::from_millis(20), Duration::from_millis(200));
        let mut child = retry_with_backoff(label, &policy, is_text_busy, |_| cmd.spawn()).map_err(|source| {
            EngineError::Spawn {
                binary: cmd.get_program().to_string_lossy().into_owned(),
                source,
            }
        })?;
        tracing::debug!(component = label, pid = child.id(), "spawned process");

        let (tx, rx) = crossbeam_channel::unbounded();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            thread::spawn(move || pump(stdout, Stream::Stdout, tx));
        }
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || pump(stderr, Stream::Stderr, tx));
        }

        *guard = Some(child);
        Ok(Some(rx))
    }

    fn try_wait(&self, label: &str) -> Result<Option<ExitStatus>, EngineError> {
        let mut guard = self.child.lock();
        let status = match guard.as_mut() {
            Some(child) => child.try_wait().map_err(|source| EngineError::Spawn {
                binary: label.to_string(),
                source,
            })?,
            None => return Ok(None),
        };
        if status.is_some() {
            *guard = None;
        }
        Ok(status)
    }
}

fn is_text_busy(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ETXTBSY)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

/// Forward `reader` line by line until EOF.
fn pump<R: Read>(mut reader: R, stream: Stream, tx: Sender<OutputLine>) {
    let mut chunk = [0u8; 8192];
    let mut line = Vec::new();
    let send = |line: &mut Vec<u8>| {
        if line.is_empty() {
            return true;
        }
        let text = String::from_utf8_lossy(line).trim_end().to_string();
        line.clear();
        text.is_empty() || tx.send(OutputLine { stream, text }).is_ok()
    };

    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                for &byte in &chunk[..n] {
                    if byte == b'\n' || byte == b'\r' {
                        if !send(&mut line) {
                            return;
                        }
                    } else {
                        line.push(byte);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    send(&mut line);
}
