//! Shuttle - Command-line front end for the transfer job engine.
//!
//! Jobs are stored in the engine's data directory. Transfers run inside
//! this process: `start` and `run` stay in the foreground, printing
//! progress until every supervised job has finished.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use shuttle_engine::{
    BackgroundMonitor, Config, DeletionMode, ErrorLog, Job, JobConfig, JobId, JobManager, JobSettings, JobStatus,
    JobUpdate, NotificationChannel, SettingsPatch, TransferType, VerificationMode,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Shuttle - resumable rsync/rclone transfer jobs
#[derive(Parser, Debug)]
#[command(name = "shuttle")]
#[command(version)]
#[command(about = "Create and supervise resumable rsync/rclone transfer jobs")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the data directory holding jobs.json and errors.jsonl
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a job without starting it
    Create(CreateArgs),
    /// Start jobs and supervise them until they finish
    Start {
        #[arg(required = true)]
        ids: Vec<JobId>,
    },
    /// Pause a running job
    Pause { id: JobId },
    /// Delete a job, stopping it first if needed
    Delete { id: JobId },
    /// Show one job in detail
    Status { id: JobId },
    /// List all jobs
    List,
    /// Change the mutable settings of a job
    Set(SetArgs),
    /// Recover interrupted jobs and supervise until nothing is running
    Run {
        /// Restart jobs that a crash left interrupted
        #[arg(long)]
        resume: bool,

        /// Additional jobs to start
        ids: Vec<JobId>,
    },
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// Human readable job name
    name: String,

    /// Source path or remote spec
    #[arg(long, value_name = "LOCATION")]
    source: String,

    /// Destination path or remote spec
    #[arg(long, value_name = "LOCATION")]
    dest: String,

    /// Transfer tool: rsync or rclone
    #[arg(long, value_name = "TOOL", default_value = "rsync")]
    tool: TransferType,

    /// Bandwidth limit in KiB/s
    #[arg(long, value_name = "KIB")]
    bwlimit: Option<u64>,

    /// Delete source files once they are safely at the destination
    #[arg(long)]
    delete_source: bool,

    /// Deletion mode: verify_then_delete or per_file
    #[arg(long, value_name = "MODE", default_value = "verify_then_delete")]
    deletion_mode: DeletionMode,

    /// Confirm that source data will be removed
    #[arg(long, requires = "delete_source")]
    confirm_delete: bool,

    /// Verification mode: fast, checksum or verify_after
    #[arg(long, value_name = "MODE", default_value = "fast")]
    verify: VerificationMode,
}

#[derive(Args, Debug)]
struct SetArgs {
    id: JobId,

    /// Version the change is based on; defaults to the current one
    #[arg(long, value_name = "VERSION")]
    expect_version: Option<u64>,

    /// New bandwidth limit in KiB/s
    #[arg(long, value_name = "KIB", conflicts_with = "no_bwlimit")]
    bwlimit: Option<u64>,

    /// Remove the bandwidth limit
    #[arg(long)]
    no_bwlimit: bool,

    /// New verification mode
    #[arg(long, value_name = "MODE")]
    verify: Option<VerificationMode>,
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

fn progress_bar(percent: f64) -> String {
    let percent = percent.clamp(0.0, 100.0) as u32;
    let filled = (percent / 5) as usize;
    let empty = 20 - filled;
    format!("[{}{}] {:3}%", "=".repeat(filled), " ".repeat(empty), percent)
}

fn short_id(id: &JobId) -> String {
    id.to_string().chars().take(8).collect()
}

fn print_update(update: &JobUpdate) {
    let mut line = format!(
        "{} {:<9} {} {}/{}",
        short_id(&update.job_id),
        update.status.to_string(),
        progress_bar(update.percent),
        format_bytes(update.bytes_transferred),
        format_bytes(update.total_bytes)
    );
    if update.status == JobStatus::Running && update.speed > 0.0 {
        line.push_str(&format!(" {}/s", format_bytes(update.speed as u64)));
        if let Some(eta) = update.eta_seconds {
            line.push_str(&format!(" eta {}", format_duration(Duration::from_secs(eta))));
        }
    }
    if update.deletion.files_deleted > 0 {
        line.push_str(&format!(
            " | deleted {} files ({})",
            update.deletion.files_deleted,
            format_bytes(update.deletion.bytes_deleted)
        ));
    }
    eprintln!("{}", line);
    if let Some(error) = &update.error {
        eprintln!("    {}", error);
    }
}

fn print_job(job: &Job, errors: &[shuttle_engine::ErrorEvent]) {
    let progress = &job.progress;
    println!("Job {}", job.id);
    println!("  Name:        {}", job.name);
    println!("  Status:      {} (version {})", job.status, job.version);
    println!("  Tool:        {}", job.transfer_type);
    println!("  Source:      {}", job.source);
    println!("  Destination: {}", job.dest);
    println!(
        "  Progress:    {} {}/{}, {} files",
        progress_bar(progress.percent),
        format_bytes(progress.bytes_transferred),
        format_bytes(progress.total_bytes),
        progress.files_transferred
    );
    if let Some(limit) = job.settings.bandwidth_limit {
        println!("  Bandwidth:   {} KiB/s", limit);
    }
    println!("  Verify:      {:?}", job.settings.verification_mode);
    if let Some(passed) = progress.verification.passed {
        println!(
            "  Verified:    {} ({} checked, {} mismatches)",
            if passed { "ok" } else { "FAILED" },
            progress.verification.files_checked,
            progress.verification.mismatches
        );
    }
    if job.settings.deletion_enabled {
        println!(
            "  Deletion:    {:?}, phase {}, {} files ({})",
            job.settings.deletion_mode,
            progress.deletion.phase,
            progress.deletion.files_deleted,
            format_bytes(progress.deletion.bytes_deleted)
        );
    }
    if job.attempts > 0 {
        println!("  Restarts:    {}", job.attempts);
    }
    println!("  Created:     {}", job.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Updated:     {}", job.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(error) = &job.error {
        println!("  Error:       {}", error);
    }
    if !errors.is_empty() {
        println!();
        println!("Recent errors:");
        for event in errors {
            println!(
                "  {} {:?} [{}] {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.severity,
                event.component,
                event.message
            );
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

fn init_logging(cli: &Cli, config: &Config) -> Result<()> {
    let directive = match cli.verbose {
        0 => config
            .log
            .level
            .clone()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_new(&directive).with_context(|| format!("invalid log filter '{}'", directive))?;

    let file_layer = match &config.log.file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
            let name = path.file_name().context("log.file has no file name")?;
            std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            Some(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(appender))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("failed to install the log subscriber")?;
    Ok(())
}

/// Start `ids` (after crash recovery) and print updates until nothing runs.
fn supervise(manager: Arc<JobManager>, config: &Config, ids: &[JobId], resume: bool) -> Result<()> {
    let notifier = Arc::new(NotificationChannel::new(config.notify.min_flush_interval));
    let updates = notifier.subscribe_channel();
    let mut monitor = BackgroundMonitor::new(Arc::clone(&manager), notifier, config.monitor.clone());

    let recovered = monitor.recover().context("crash recovery failed")?;
    for id in &recovered {
        eprintln!("Recovered interrupted job {} (now paused)", short_id(id));
    }

    let mut watched: Vec<JobId> = ids.to_vec();
    if resume {
        watched.extend(recovered.iter().copied().filter(|id| !ids.contains(id)));
    }
    for id in &watched {
        manager.start_job(*id).with_context(|| format!("failed to start job {}", id))?;
    }
    if !manager.has_running_jobs() {
        eprintln!("Nothing to run.");
        return Ok(());
    }

    tracing::debug!(jobs = watched.len(), "supervising jobs");
    let handle = monitor.spawn().context("failed to start the background monitor")?;
    let start_time = Instant::now();
    while manager.has_running_jobs() {
        match updates.recv_timeout(Duration::from_millis(500)) {
            Ok(batch) => batch.iter().for_each(print_update),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    let health = handle.health();
    handle.shutdown();
    updates.try_iter().flatten().for_each(|update| print_update(&update));
    manager.shutdown().context("failed to shut down cleanly")?;

    if health.degraded {
        eprintln!("Warning: engine health degraded: {}", health.reasons.join("; "));
    }

    let jobs: Vec<Job> = watched
        .iter()
        .filter_map(|id| manager.get_job_status(*id).ok())
        .collect();
    let failed = jobs.iter().filter(|job| job.status == JobStatus::Failed).count();
    eprintln!();
    eprintln!(
        "Summary: {} completed, {} failed in {}",
        jobs.iter().filter(|job| job.status == JobStatus::Completed).count(),
        failed,
        format_duration(start_time.elapsed())
    );
    if failed > 0 {
        bail!("{} job(s) failed", failed);
    }
    Ok(())
}

/// Main CLI logic - separated for testability
fn run_cli(cli: &Cli, config: &Config) -> Result<()> {
    let manager = Arc::new(JobManager::open(config).context("failed to open the job store")?);

    match &cli.command {
        Command::Create(args) => {
            let id = manager.create_job(JobConfig {
                name: args.name.clone(),
                source: args.source.clone(),
                dest: args.dest.clone(),
                transfer_type: args.tool,
                settings: JobSettings {
                    bandwidth_limit: args.bwlimit,
                    deletion_enabled: args.delete_source,
                    deletion_mode: args.deletion_mode,
                    deletion_confirmed: args.confirm_delete,
                    verification_mode: args.verify,
                },
            })?;
            println!("{}", id);
        }
        Command::Start { ids } => supervise(manager, config, ids, false)?,
        Command::Run { resume, ids } => supervise(manager, config, ids, *resume)?,
        Command::Pause { id } => {
            manager.pause_job(*id)?;
            println!("{} {}", id, manager.get_job_status(*id)?.status);
        }
        Command::Delete { id } => {
            manager.delete_job(*id)?;
            println!("Deleted {}", id);
        }
        Command::Status { id } => {
            let job = manager.get_job_status(*id)?;
            let errors: Vec<_> = ErrorLog::read_all(&config.error_log_path())
                .unwrap_or_default()
                .into_iter()
                .filter(|event| event.job_id == Some(job.id))
                .collect();
            let recent = &errors[errors.len().saturating_sub(5)..];
            print_job(&job, recent);
        }
        Command::List => {
            let jobs = manager.list_jobs();
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in jobs {
                println!(
                    "{}  {:<9} {:>4.0}%  {:<6} {}  {} -> {}",
                    short_id(&job.id),
                    job.status.to_string(),
                    job.progress.percent,
                    job.transfer_type.to_string(),
                    job.name,
                    job.source,
                    job.dest
                );
            }
        }
        Command::Set(args) => {
            let patch = SettingsPatch {
                bandwidth_limit: if args.no_bwlimit {
                    Some(None)
                } else {
                    args.bwlimit.map(Some)
                },
                verification_mode: args.verify,
            };
            if patch.is_empty() {
                bail!("nothing to change; pass --bwlimit, --no-bwlimit or --verify");
            }
            let expected = match args.expect_version {
                Some(version) => version,
                None => manager.get_job_status(args.id)?.version,
            };
            let job = manager.update_job_settings(args.id, expected, &patch)?;
            println!("{} updated (version {})", job.id, job.version);
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let result = load_config(&cli).and_then(|config| {
        init_logging(&cli, &config)?;
        run_cli(&cli, &config)
    });

    let exit_code = match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}
