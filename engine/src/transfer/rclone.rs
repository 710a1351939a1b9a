//! rclone support.
//!
//! rclone runs with `--use-json-log`, so every log record on stderr is one
//! JSON object. Records carrying a `stats` object (emitted every second by
//! `--stats 1s`) drive progress.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::verify::{VerifiedFile, VerifyReport};
use super::{check_common_location, TransferTool};
use crate::config::ToolsConfig;
use crate::fs_ops;
use crate::model::{Job, TransferType, VerificationMode};
use crate::progress::{ToolEvent, TransferStats};

/// rclone's "temporary error" exit status.
const EXIT_TEMPORARY: i32 = 5;

pub struct Rclone;

#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(default)]
    level: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    stats: Option<StatsRecord>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StatsRecord {
    bytes: u64,
    total_bytes: u64,
    speed: f64,
    eta: Option<f64>,
    transfers: u64,
    deletes: u64,
}

impl TransferTool for Rclone {
    const KIND: TransferType = TransferType::Rclone;
    const COMPONENT: &'static str = "engine.rclone";
    const CONFIG_KEY: &'static str = "tools.rclone_path";
    const LIST_SEPARATOR: u8 = b'\n';

    fn binary(tools: &ToolsConfig) -> &Path {
        &tools.rclone_path
    }

    fn validate_location(location: &str) -> Result<(), String> {
        check_common_location(location)?;
        if fs_ops::is_remote(location) {
            let remote = location.split(':').next().unwrap_or_default();
            let valid = remote
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ' | '+' | '@'));
            if !valid || remote.starts_with(' ') || remote.ends_with(' ') {
                return Err(format!("'{}' is not a valid rclone remote name", remote));
            }
        }
        Ok(())
    }

    fn transfer_args(job: &Job, move_files: bool) -> Vec<String> {
        let mut args = vec![
            if move_files { "move" } else { "copy" }.to_string(),
            job.source.clone(),
            job.dest.clone(),
        ];
        args.extend(
            [
                "--use-json-log",
                "--stats",
                "1s",
                "--stats-log-level",
                "NOTICE",
                "--retries",
                "1",
                "-v",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        if let Some(limit) = job.settings.bandwidth_limit {
            args.push("--bwlimit".to_string());
            args.push(format!("{}K", limit));
        }
        if job.settings.verification_mode == VerificationMode::Checksum {
            args.push("--checksum".to_string());
        }
        args
    }

    fn parse_line(line: &str) -> Option<ToolEvent> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        let record: LogRecord = serde_json::from_str(line).ok()?;

        if let Some(stats) = record.stats {
            return Some(ToolEvent::Stats(TransferStats {
                bytes: stats.bytes,
                total_bytes: (stats.total_bytes > 0).then_some(stats.total_bytes),
                percent: None,
                speed: stats.speed,
                eta_seconds: stats.eta.filter(|eta| *eta >= 0.0).map(|eta| eta.round() as u64),
                transfers: Some(stats.transfers),
                deletes: Some(stats.deletes),
            }));
        }
        match record.level.as_str() {
            "error" | "critical" | "fatal" => Some(ToolEvent::Error(match record.object {
                Some(object) => format!("{}: {}", object, record.msg),
                None => record.msg,
            })),
            _ => Some(ToolEvent::Other),
        }
    }

    fn is_transient_exit(code: i32) -> bool {
        code == EXIT_TEMPORARY
    }

    fn verify_args(job: &Job, checksum: bool) -> Vec<String> {
        let mut args = vec![
            "check".to_string(),
            job.source.clone(),
            job.dest.clone(),
            "--one-way".to_string(),
            "--match".to_string(),
            "-".to_string(),
        ];
        if !checksum {
            args.push("--size-only".to_string());
        }
        args
    }

    /// `rclone check` exits 1 when it found differences and reports
    /// `N differences found` / `N matching files` as NOTICE lines on stderr.
    /// `--match -` prints the matching paths on stdout, one per line.
    fn parse_verify(code: Option<i32>, stdout: &str, stderr: &str) -> Result<VerifyReport, String> {
        let mut differences = None;
        let mut matching = None;
        let mut names = Vec::new();
        for line in stderr.lines() {
            if let Some(count) = count_before(line, "differences found") {
                differences = Some(count);
            } else if let Some(count) = count_before(line, "matching files") {
                matching = Some(count);
            } else if let Some((_, rest)) = line.split_once("ERROR : ") {
                if let Some((name, _)) = rest.split_once(": ") {
                    names.push(name.to_string());
                }
            }
        }

        match code {
            Some(0) | Some(1) => {}
            Some(code) => return Err(format!("rclone check exited with code {}", code)),
            None => return Err("rclone check was killed".to_string()),
        }
        let differences = match (code, differences) {
            (_, Some(n)) => n,
            (Some(1), None) if names.is_empty() => {
                return Err("rclone check failed without reporting differences".to_string())
            }
            _ => names.len() as u64,
        };

        let mut report = VerifyReport::default();
        for name in names.into_iter().take(differences as usize) {
            report.record_mismatch(name);
        }
        report.mismatches = differences;
        report.verified = stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(VerifiedFile::named)
            .collect();
        report.files_checked = matching.unwrap_or(report.verified.len() as u64) + differences;
        Ok(report)
    }

    fn delete_source_args(job: &Job, checksum: bool, file_list: &Path) -> Vec<String> {
        let mut args = vec![
            "move".to_string(),
            job.source.clone(),
            job.dest.clone(),
            "--files-from-raw".to_string(),
            file_list.display().to_string(),
        ];
        if checksum {
            args.push("--checksum".to_string());
        }
        args
    }

    fn cleanup_command(job: &Job, tools: &ToolsConfig) -> Option<(PathBuf, Vec<String>)> {
        Some((
            tools.rclone_path.clone(),
            vec!["rmdirs".to_string(), job.source.clone(), "--leave-root".to_string()],
        ))
    }
}

/// The integer right before `marker`, e.g. `... at /dst: 3 differences found`.
fn count_before(line: &str, marker: &str) -> Option<u64> {
    let (before, _) = line.split_once(marker)?;
    before.split_whitespace().last()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobConfig, JobSettings};
    use chrono::Utc;

    fn job(settings: JobSettings) -> Job {
        Job::from_config(
            JobConfig {
                name: "docs".into(),
                source: "/home/me/docs".into(),
                dest: "b2:archive/docs".into(),
                transfer_type: TransferType::Rclone,
                settings,
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_stats_record() {
        let line = r#"{"level":"notice","msg":"\nTransferred: 1 MiB / 4 MiB","source":"accounting/stats.go:520","stats":{"bytes":1048576,"checks":0,"deletes":2,"elapsedTime":3.2,"errors":0,"eta":6,"fatalError":false,"renames":0,"retryError":false,"speed":349525.3,"totalBytes":4194304,"totalChecks":0,"totalTransfers":8,"transferTime":3,"transfers":2},"time":"2024-05-01T10:00:00.000000+00:00"}"#;
        let Some(ToolEvent::Stats(stats)) = Rclone::parse_line(line) else {
            panic!("expected stats");
        };
        assert_eq!(stats.bytes, 1_048_576);
        assert_eq!(stats.total_bytes, Some(4_194_304));
        assert_eq!(stats.eta_seconds, Some(6));
        assert_eq!(stats.transfers, Some(2));
        assert_eq!(stats.deletes, Some(2));
    }

    #[test]
    fn test_stats_without_total_or_eta() {
        let line = r#"{"level":"notice","msg":"","stats":{"bytes":10,"eta":null,"speed":0,"totalBytes":0}}"#;
        let Some(ToolEvent::Stats(stats)) = Rclone::parse_line(line) else {
            panic!("expected stats");
        };
        assert_eq!(stats.total_bytes, None);
        assert_eq!(stats.eta_seconds, None);
    }

    #[test]
    fn test_error_and_info_records() {
        let error = r#"{"level":"error","msg":"Failed to copy: read tcp 10.0.0.2:443: connection reset by peer","object":"a.txt","time":"2024-05-01T10:00:00Z"}"#;
        assert_eq!(
            Rclone::parse_line(error),
            Some(ToolEvent::Error(
                "a.txt: Failed to copy: read tcp 10.0.0.2:443: connection reset by peer".into()
            ))
        );

        let info = r#"{"level":"info","msg":"Copied (new)","object":"a.txt"}"#;
        assert_eq!(Rclone::parse_line(info), Some(ToolEvent::Other));
        assert_eq!(Rclone::parse_line("2024/05/01 10:00:00 NOTICE: plain text"), None);
    }

    #[test]
    fn test_transfer_args() {
        let mut settings = JobSettings::default();
        settings.bandwidth_limit = Some(512);
        let args = Rclone::transfer_args(&job(settings), true);
        assert_eq!(&args[..3], &["move", "/home/me/docs", "b2:archive/docs"]);
        assert!(args.windows(2).any(|w| w[0] == "--bwlimit" && w[1] == "512K"));
        assert!(args.contains(&"--use-json-log".to_string()));

        let args = Rclone::transfer_args(&job(JobSettings::default()), false);
        assert_eq!(args[0], "copy");
        assert!(!args.contains(&"--bwlimit".to_string()));
    }

    #[test]
    fn test_validate_locations() {
        assert!(Rclone::validate_location("b2:archive/docs").is_ok());
        assert!(Rclone::validate_location("my-remote:").is_ok());
        assert!(Rclone::validate_location("/srv/data").is_ok());
        assert!(Rclone::validate_location("bad$name:path").is_err());
        assert!(Rclone::validate_location("-v").is_err());
    }

    #[test]
    fn test_parse_verify_differences() {
        let stderr = "\
2024/05/01 10:00:00 ERROR : report.pdf: sizes differ
2024/05/01 10:00:00 ERROR : notes.txt: file not in Local file system at /dst
2024/05/01 10:00:00 NOTICE: Local file system at /dst: 2 differences found
2024/05/01 10:00:00 NOTICE: Local file system at /dst: 2 errors while checking
2024/05/01 10:00:00 NOTICE: Local file system at /dst: 10 matching files
";
        let report = Rclone::parse_verify(Some(1), "", stderr).expect("parse");
        assert_eq!(report.mismatches, 2);
        assert_eq!(report.files_checked, 12);
        assert_eq!(report.mismatched, vec!["report.pdf".to_string(), "notes.txt".to_string()]);
    }

    #[test]
    fn test_parse_verify_clean() {
        let stderr = "NOTICE: b2 bucket archive: 0 differences found\nNOTICE: b2 bucket archive: 2 matching files\n";
        let report = Rclone::parse_verify(Some(0), "a.txt\nsub dir/b.txt\n", stderr).expect("parse");
        assert!(report.passed());
        assert_eq!(report.files_checked, 2);
        assert_eq!(
            report.verified,
            vec![VerifiedFile::named("a.txt"), VerifiedFile::named("sub dir/b.txt")]
        );
    }

    #[test]
    fn test_verify_and_delete_args() {
        let job = job(JobSettings::default());
        let verify = Rclone::verify_args(&job, false);
        assert!(verify.windows(2).any(|w| w[0] == "--match" && w[1] == "-"));
        assert!(verify.contains(&"--size-only".to_string()));

        let delete = Rclone::delete_source_args(&job, false, Path::new("/tmp/shuttle-files-x"));
        assert_eq!(
            delete,
            vec!["move", "/home/me/docs", "b2:archive/docs", "--files-from-raw", "/tmp/shuttle-files-x"]
        );
        assert!(!delete.contains(&"delete".to_string()));
    }

    #[test]
    fn test_parse_verify_tool_failure() {
        assert!(Rclone::parse_verify(Some(7), "", "Failed to create file system").is_err());
        assert!(Rclone::parse_verify(Some(1), "", "CRITICAL: something broke").is_err());
    }

    #[test]
    fn test_cleanup_keeps_root() {
        let (_, args) = Rclone::cleanup_command(&job(JobSettings::default()), &ToolsConfig::default())
            .expect("rclone can always clean up");
        assert_eq!(args, vec!["rmdirs", "/home/me/docs", "--leave-root"]);
    }
}
