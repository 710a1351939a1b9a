//! Engines driven against shell-script stand-ins for rsync and rclone.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shuttle_engine::checksums::ChecksumAlgorithm;
use shuttle_engine::config::ToolsConfig;
use shuttle_engine::{
    BackgroundMonitor, Config, DeletionMode, DeletionPhase, Engine, EngineSettings, EngineState, ErrorLog, Job,
    JobConfig, JobManager, JobSettings, JobStatus, NotificationChannel, ProgressSnapshot, RcloneEngine,
    RetryPolicy, RsyncEngine, TransferType, VerificationMode,
};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}", body)).expect("Failed to write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("Failed to chmod script");
    path
}

fn settings(tools: ToolsConfig) -> Arc<EngineSettings> {
    Arc::new(EngineSettings {
        tools,
        retry: RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50)),
        free_space_margin: 0.1,
        checksum: ChecksumAlgorithm::Blake3,
        error_log: Arc::new(ErrorLog::in_memory()),
    })
}

fn wait_finished(engine: &dyn Engine) -> ProgressSnapshot {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let snapshot = engine.progress();
        if snapshot.state.is_finished() {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "engine did not finish: {:?}", snapshot);
        thread::sleep(Duration::from_millis(20));
    }
}

fn trees(files: &[(&str, &[u8])]) -> (tempfile::TempDir, PathBuf, PathBuf) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let src = temp_dir.path().join("src");
    let dst = temp_dir.path().join("dst");
    fs::create_dir_all(&src).expect("Failed to create src dir");
    fs::create_dir_all(&dst).expect("Failed to create dst dir");
    for (name, content) in files {
        fs::write(src.join(name), content).expect("Failed to write source file");
    }
    (temp_dir, src, dst)
}

fn path_str(path: &Path) -> String {
    path.to_str().expect("utf8 path").to_string()
}

/// Fake rsync copying the top-level files of SRC into DEST, moving them
/// when `--remove-source-files` is given. `transfer` is the shell command
/// producing `$dest/$name` from `$f`.
fn fake_rsync(dir: &Path, transfer: &str, fail_after: Option<usize>) -> PathBuf {
    let log = dir.join("args.log");
    let sent = dir.join("sent.log");
    let marker = dir.join("failed_once");
    let failure = match fail_after {
        Some(n) => format!(
            r#"  if [ ! -e "{marker}" ] && [ "$count" -ge {n} ]; then
    touch "{marker}"
    echo "rsync: connection unexpectedly closed (0 bytes received so far) [sender]" >&2
    echo "rsync error: error in rsync protocol data stream (code 12) at io.c(228) [sender=3.2.7]" >&2
    exit 12
  fi
"#,
            marker = marker.display(),
            n = n
        ),
        None => String::new(),
    };
    let body = format!(
        r#"echo "$*" >> "{log}"
move=0
for arg in "$@"; do
  case "$arg" in --remove-source-files) move=1 ;; esac
done
for last in "$@"; do src="$dest"; dest="$last"; done
count=0
for f in "$src"*; do
  [ -f "$f" ] || continue
  name=$(basename "$f")
{failure}  size=$(wc -c < "$f" | tr -d ' ')
  {transfer}
  echo "$name" >> "{sent}"
  if [ "$move" = 1 ]; then rm "$f"; fi
  echo "FILE:$size:$name"
  count=$((count + 1))
done
exit 0
"#,
        log = log.display(),
        sent = sent.display(),
        failure = failure,
        transfer = transfer
    );
    write_script(dir, "rsync", &body)
}

fn job(src: &Path, dst: &Path, transfer_type: TransferType, settings: JobSettings) -> Job {
    let mut job = Job::from_config(
        JobConfig {
            name: "scripted".into(),
            source: path_str(src),
            dest: path_str(dst),
            transfer_type,
            settings,
        },
        chrono::Utc::now(),
    );
    job.status = JobStatus::Running;
    job
}

fn per_file_settings() -> JobSettings {
    JobSettings {
        deletion_enabled: true,
        deletion_confirmed: true,
        deletion_mode: DeletionMode::PerFile,
        ..JobSettings::default()
    }
}

#[test]
fn test_transient_failure_restarts_with_move_semantics() {
    let files: &[(&str, &[u8])] = &[
        ("a.txt", b"alpha"),
        ("b.txt", b"bravo!"),
        ("c.txt", b"charlie"),
        ("d.txt", b"delta"),
        ("e.txt", b"echo"),
    ];
    let (temp_dir, src, dst) = trees(files);
    fs::create_dir(src.join("emptied")).expect("Failed to create nested dir");
    let bin = temp_dir.path().join("bin");
    fs::create_dir(&bin).expect("Failed to create bin dir");
    let script = fake_rsync(&bin, r#"cp -p "$f" "$dest/$name""#, Some(2));

    let mut tools = ToolsConfig::default();
    tools.rsync_path = script;
    let engine = RsyncEngine::new(settings(tools));
    engine
        .start(&job(&src, &dst, TransferType::Rsync, per_file_settings()))
        .expect("start");
    let snapshot = wait_finished(&engine);

    assert_eq!(snapshot.state, EngineState::Completed, "{:?}", snapshot.error);
    assert_eq!(snapshot.attempt, 2, "one restart after the dropped connection");

    let args = fs::read_to_string(bin.join("args.log")).expect("read args log");
    let runs: Vec<&str> = args.lines().collect();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|run| run.contains("--remove-source-files")));
    assert!(runs.iter().all(|run| run.contains("--partial")));

    // Moved files were not sent again
    let sent = fs::read_to_string(bin.join("sent.log")).expect("read sent log");
    let mut names: Vec<&str> = sent.lines().collect();
    names.sort_unstable();
    assert_eq!(names, vec!["a.txt", "b.txt", "c.txt", "d.txt", "e.txt"]);

    let progress = &snapshot.progress;
    assert_eq!(progress.files_transferred, 5);
    assert_eq!(progress.deletion.files_deleted, 5);
    assert_eq!(progress.deletion.bytes_deleted, 27);
    assert_eq!(progress.deletion.phase, DeletionPhase::Done);
    assert_eq!(progress.percent, 100.0);

    for (name, content) in files {
        assert!(!src.join(name).exists());
        assert_eq!(fs::read(dst.join(name)).expect("read dest"), *content);
    }
    assert!(src.is_dir(), "source root is kept");
    assert!(!src.join("emptied").exists(), "empty directories are cleaned up");
}

#[test]
fn test_fatal_exit_fails_without_retry() {
    let (temp_dir, src, dst) = trees(&[("a.txt", b"alpha")]);
    let script = write_script(
        temp_dir.path(),
        "rsync",
        "echo 'rsync: change_dir \"/nope\" failed: No such file or directory (2)' >&2\nexit 23\n",
    );
    let mut tools = ToolsConfig::default();
    tools.rsync_path = script;
    let engine = RsyncEngine::new(settings(tools));
    engine
        .start(&job(&src, &dst, TransferType::Rsync, JobSettings::default()))
        .expect("start");

    let snapshot = wait_finished(&engine);
    assert_eq!(snapshot.state, EngineState::Failed);
    assert_eq!(snapshot.attempt, 1);
    let error = snapshot.error.expect("failure message");
    assert!(error.contains("code 23"), "{}", error);
    assert!(error.contains("change_dir"), "{}", error);
}

#[test]
fn test_stop_terminates_running_transfer() {
    let (temp_dir, src, dst) = trees(&[("a.txt", b"alpha")]);
    let script = write_script(temp_dir.path(), "rsync", "exec sleep 30\n");
    let mut tools = ToolsConfig::default();
    tools.rsync_path = script;
    let engine = RsyncEngine::new(settings(tools));
    engine
        .start(&job(&src, &dst, TransferType::Rsync, JobSettings::default()))
        .expect("start");
    thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    engine.stop(Duration::from_secs(2)).expect("stop");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(engine.progress().state, EngineState::Stopped);
}

#[test]
fn test_rclone_json_stats_drive_progress() {
    let (temp_dir, src, dst) = trees(&[("a.txt", b"alpha")]);
    let log = temp_dir.path().join("rclone.log");
    let body = format!(
        r#"echo "$*" > "{log}"
echo '{{"level":"info","msg":"Copied (new)","object":"a.txt"}}' >&2
echo '{{"level":"notice","msg":"","stats":{{"bytes":100,"totalBytes":200,"speed":50.0,"eta":2,"transfers":1,"deletes":0}}}}' >&2
exit 0
"#,
        log = log.display()
    );
    let mut tools = ToolsConfig::default();
    tools.rclone_path = write_script(temp_dir.path(), "rclone", &body);
    let engine = RcloneEngine::new(settings(tools));
    engine
        .start(&job(&src, &dst, TransferType::Rclone, JobSettings::default()))
        .expect("start");

    let snapshot = wait_finished(&engine);
    assert_eq!(snapshot.state, EngineState::Completed, "{:?}", snapshot.error);
    assert_eq!(snapshot.progress.bytes_transferred, 100);
    assert_eq!(snapshot.progress.total_bytes, 200);
    assert_eq!(snapshot.progress.files_transferred, 1);
    let args = fs::read_to_string(&log).expect("read args");
    assert!(args.starts_with("copy "));
    assert!(args.contains("--use-json-log"));
}

fn run_through_manager(transfer: &str) -> (tempfile::TempDir, PathBuf, PathBuf, Job) {
    let (temp_dir, src, dst) = trees(&[("one.txt", b"1"), ("two.txt", b"22"), ("three.txt", b"333")]);
    let bin = temp_dir.path().join("bin");
    fs::create_dir(&bin).expect("Failed to create bin dir");

    let mut config = Config::default();
    config.data_dir = temp_dir.path().join("data");
    config.tools.rsync_path = fake_rsync(&bin, transfer, None);
    let manager = Arc::new(JobManager::open(&config).expect("open manager"));
    let notifier = Arc::new(NotificationChannel::new(Duration::ZERO));
    let mut monitor = BackgroundMonitor::new(Arc::clone(&manager), notifier, config.monitor.clone());

    let id = manager
        .create_job(JobConfig {
            name: "archive".into(),
            source: path_str(&src),
            dest: path_str(&dst),
            transfer_type: TransferType::Rsync,
            settings: JobSettings {
                deletion_enabled: true,
                deletion_confirmed: true,
                deletion_mode: DeletionMode::VerifyThenDelete,
                ..JobSettings::default()
            },
        })
        .expect("create");
    manager.start_job(id).expect("start");

    let deadline = Instant::now() + Duration::from_secs(20);
    while monitor.tick() {
        assert!(Instant::now() < deadline, "job did not finish");
        thread::sleep(Duration::from_millis(20));
    }
    let job = manager.get_job_status(id).expect("status");
    (temp_dir, src, dst, job)
}

#[test]
fn test_verify_then_delete_removes_verified_source() {
    let (_guard, src, dst, job) = run_through_manager(r#"cp -p "$f" "$dest/$name""#);

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(job.progress.verification.passed, Some(true));
    assert_eq!(job.progress.verification.files_checked, 3);
    assert_eq!(job.progress.deletion.phase, DeletionPhase::Done);
    assert_eq!(job.progress.deletion.files_deleted, 3);
    assert_eq!(job.progress.deletion.bytes_deleted, 6);
    assert_eq!(fs::read_dir(&src).expect("read src").count(), 0);
    assert_eq!(fs::read(dst.join("three.txt")).expect("read dest"), b"333");
}

#[test]
fn test_failed_verification_skips_deletion() {
    let (_guard, src, _dst, job) = run_through_manager(r#"echo corrupted > "$dest/$name""#);

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.verification.passed, Some(false));
    assert_eq!(job.progress.verification.mismatches, 3);
    assert_eq!(job.progress.deletion.phase, DeletionPhase::Skipped);
    assert_eq!(job.progress.deletion.files_deleted, 0);
    assert!(job.error.as_deref().unwrap_or_default().contains("source left in place"));
    assert_eq!(fs::read(src.join("two.txt")).expect("source intact"), b"22");
}

fn run_verify_after(transfer: &str) -> (tempfile::TempDir, PathBuf, PathBuf, ProgressSnapshot) {
    let (temp_dir, src, dst) = trees(&[("one.txt", b"1"), ("two.txt", b"22"), ("three.txt", b"333")]);
    let bin = temp_dir.path().join("bin");
    fs::create_dir(&bin).expect("Failed to create bin dir");

    let mut tools = ToolsConfig::default();
    tools.rsync_path = fake_rsync(&bin, transfer, None);
    let engine = RsyncEngine::new(settings(tools));
    let job_settings = JobSettings {
        verification_mode: VerificationMode::VerifyAfter,
        ..JobSettings::default()
    };
    engine
        .start(&job(&src, &dst, TransferType::Rsync, job_settings))
        .expect("start");
    let snapshot = wait_finished(&engine);
    (temp_dir, src, dst, snapshot)
}

#[test]
fn test_verify_after_without_deletion_checks_the_copy() {
    let (_guard, src, _dst, snapshot) = run_verify_after(r#"cp -p "$f" "$dest/$name""#);

    assert_eq!(snapshot.state, EngineState::Completed, "{:?}", snapshot.error);
    assert_eq!(snapshot.error, None);
    let progress = &snapshot.progress;
    assert_eq!(progress.verification.passed, Some(true));
    assert_eq!(progress.verification.files_checked, 3);
    assert_eq!(progress.verification.mismatches, 0);
    assert_eq!(progress.deletion.phase, DeletionPhase::None);
    assert_eq!(progress.deletion.files_deleted, 0);
    assert_eq!(fs::read_dir(&src).expect("read src").count(), 3);
}

#[test]
fn test_verify_after_reports_corrupted_copy() {
    let (_guard, src, _dst, snapshot) = run_verify_after(r#"echo corrupted > "$dest/$name""#);

    assert_eq!(snapshot.state, EngineState::Completed);
    let progress = &snapshot.progress;
    assert_eq!(progress.verification.passed, Some(false));
    assert_eq!(progress.verification.files_checked, 3);
    assert_eq!(progress.verification.mismatches, 3);
    let note = snapshot.error.expect("mismatch is noted on the job");
    assert!(note.contains("3 mismatched of 3 files"), "{}", note);
    assert_eq!(fs::read(src.join("two.txt")).expect("source intact"), b"22");
}
