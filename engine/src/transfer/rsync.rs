//! rsync support.
//!
//! Progress comes from `--info=progress2` (one overall line, refreshed with
//! `\r`) and from `--out-format=FILE:%l:%n`, which prints one line per file
//! once it has been transferred.

use std::path::{Path, PathBuf};

use super::deletion::{shell_quote, split_ssh_location};
use super::verify::{VerifiedFile, VerifyReport};
use super::{check_common_location, TransferTool};
use crate::config::ToolsConfig;
use crate::fs_ops;
use crate::model::{Job, TransferType, VerificationMode};
use crate::progress::{ToolEvent, TransferStats};

/// Socket I/O, protocol stream, timeout and daemon connect timeout.
const TRANSIENT_EXIT_CODES: [i32; 4] = [10, 12, 30, 35];

pub struct Rsync;

impl TransferTool for Rsync {
    const KIND: TransferType = TransferType::Rsync;
    const COMPONENT: &'static str = "engine.rsync";
    const CONFIG_KEY: &'static str = "tools.rsync_path";
    const LIST_SEPARATOR: u8 = b'\0';

    fn binary(tools: &ToolsConfig) -> &Path {
        &tools.rsync_path
    }

    fn validate_location(location: &str) -> Result<(), String> {
        check_common_location(location)?;
        if let Some(rest) = location.strip_prefix("rsync://") {
            if rest.split('/').next().map_or(true, str::is_empty) {
                return Err(format!("'{}' is missing a host", location));
            }
            return Ok(());
        }
        if fs_ops::is_remote(location) {
            let host = location.split(':').next().unwrap_or_default();
            let host = host.rsplit('@').next().unwrap_or_default();
            if host.is_empty() || host.contains(char::is_whitespace) {
                return Err(format!("'{}' has an invalid host", location));
            }
        }
        Ok(())
    }

    fn validate_pair(source: &str, dest: &str) -> Result<(), String> {
        if fs_ops::is_remote(source) && fs_ops::is_remote(dest) {
            return Err("rsync cannot transfer between two remote locations".to_string());
        }
        Ok(())
    }

    fn transfer_args(job: &Job, move_files: bool) -> Vec<String> {
        let mut args: Vec<String> = [
            "--archive",
            "--partial",
            "--no-inc-recursive",
            "--info=progress2",
            "--out-format=FILE:%l:%n",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(limit) = job.settings.bandwidth_limit {
            args.push(format!("--bwlimit={}", limit));
        }
        if job.settings.verification_mode == VerificationMode::Checksum {
            args.push("--checksum".to_string());
        }
        if move_files {
            args.push("--remove-source-files".to_string());
        }
        args.push(source_arg(&job.source));
        args.push(job.dest.clone());
        args
    }

    fn parse_line(line: &str) -> Option<ToolEvent> {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("FILE:") {
            let (size, name) = rest.split_once(':')?;
            let size = parse_grouped(size)?;
            if name.is_empty() || name.ends_with('/') {
                return Some(ToolEvent::Other);
            }
            return Some(ToolEvent::FileTransferred {
                name: name.to_string(),
                size,
            });
        }
        if line.starts_with("rsync:")
            || line.starts_with("rsync error:")
            || line.starts_with("ssh:")
            || line.starts_with("@ERROR")
        {
            return Some(ToolEvent::Error(line.to_string()));
        }
        parse_progress2(line).map(ToolEvent::Stats)
    }

    fn is_transient_exit(code: i32) -> bool {
        TRANSIENT_EXIT_CODES.contains(&code)
    }

    fn verify_args(job: &Job, checksum: bool) -> Vec<String> {
        // Itemizing twice lists unchanged files too
        let mut args: Vec<String> = [
            "--archive",
            "--dry-run",
            "--itemize-changes",
            "--itemize-changes",
            "--stats",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if checksum {
            args.push("--checksum".to_string());
        }
        args.push(source_arg(&job.source));
        args.push(job.dest.clone());
        args
    }

    fn parse_verify(code: Option<i32>, stdout: &str, stderr: &str) -> Result<VerifyReport, String> {
        if code != Some(0) {
            let detail = stderr.lines().last().unwrap_or("no output");
            return Err(match code {
                Some(code) => format!("rsync dry run exited with code {}: {}", code, detail),
                None => format!("rsync dry run was killed: {}", detail),
            });
        }

        let mut report = VerifyReport::default();
        let mut total_files = None;
        for line in stdout.lines() {
            if let Some(rest) = line.strip_prefix("Number of files:") {
                total_files = parse_file_count(rest);
                continue;
            }
            if let Some((flags, name)) = itemized(line) {
                let mut chars = flags.chars();
                let update = chars.next();
                let kind = chars.next();
                match (update, kind) {
                    (Some('.'), Some('f')) => report.verified.push(VerifiedFile::named(name)),
                    (Some('<' | '>' | 'c'), Some('f')) => report.record_mismatch(name),
                    _ => {}
                }
            }
        }
        report.files_checked = total_files
            .unwrap_or(0)
            .max(report.mismatches + report.verified.len() as u64);
        Ok(report)
    }

    fn delete_source_args(job: &Job, checksum: bool, file_list: &Path) -> Vec<String> {
        let mut args = vec![
            "--archive".to_string(),
            "--remove-source-files".to_string(),
            "--from0".to_string(),
            format!("--files-from={}", file_list.display()),
        ];
        if checksum {
            args.push("--checksum".to_string());
        }
        args.push(list_root(&job.source));
        args.push(job.dest.clone());
        args
    }

    fn cleanup_command(job: &Job, tools: &ToolsConfig) -> Option<(PathBuf, Vec<String>)> {
        let (host, path) = split_ssh_location(&job.source)?;
        Some((
            tools.ssh_path.clone(),
            vec![
                host.to_string(),
                format!("find {} -mindepth 1 -type d -empty -delete", shell_quote(path)),
            ],
        ))
    }
}

/// Directory sources get a trailing slash so their contents land directly
/// in the destination, matching rclone.
fn source_arg(source: &str) -> String {
    if source.ends_with('/') {
        return source.to_string();
    }
    if fs_ops::is_remote(source) || Path::new(source).is_dir() {
        format!("{}/", source)
    } else {
        source.to_string()
    }
}

/// Directory the entries of a file list are relative to. A single-file
/// source is listed by name under its parent.
fn list_root(source: &str) -> String {
    let root = source_arg(source);
    if root.ends_with('/') {
        return root;
    }
    match Path::new(source).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => format!("{}/", parent.display()),
        _ => "./".to_string(),
    }
}

/// `1,234,567` (or `1.234.567` in some locales)
fn parse_grouped(token: &str) -> Option<u64> {
    let digits: String = token.chars().filter(|c| *c != ',' && *c != '.').collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// `1.23MB/s` in bytes per second.
fn parse_rate(token: &str) -> Option<f64> {
    let value = token.strip_suffix("/s")?;
    let split = value.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.replace(',', ".").parse().ok()?;
    let multiplier = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "KB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(number * multiplier)
}

/// `h:mm:ss` or `mm:ss`
fn parse_clock(token: &str) -> Option<u64> {
    let parts: Vec<u64> = token.split(':').map(|p| p.parse().ok()).collect::<Option<_>>()?;
    match parts.as_slice() {
        [h, m, s] => Some(h * 3600 + m * 60 + s),
        [m, s] => Some(m * 60 + s),
        _ => None,
    }
}

/// `      1,234,567  45%    1.23MB/s    0:00:12 (xfr#3, to-chk=7/12)`
fn parse_progress2(line: &str) -> Option<TransferStats> {
    let mut tokens = line.split_whitespace();
    let bytes = parse_grouped(tokens.next()?)?;
    let percent: f64 = tokens.next()?.strip_suffix('%')?.parse().ok()?;
    let speed = tokens.next().and_then(parse_rate).unwrap_or(0.0);
    let eta_seconds = tokens.next().and_then(parse_clock);
    let transfers = tokens
        .find_map(|t| t.strip_prefix("(xfr#"))
        .and_then(|t| t.trim_end_matches(',').parse().ok());

    Some(TransferStats {
        bytes,
        total_bytes: None,
        percent: Some(percent),
        speed,
        eta_seconds,
        transfers,
        deletes: None,
    })
}

/// Split an `--itemize-changes` line into its change string and path.
///
/// The change string is 11 columns wide; for unchanged items its attribute
/// columns are spaces.
fn itemized(line: &str) -> Option<(&str, &str)> {
    let flags = line.get(..11)?;
    let name = line.get(11..)?.strip_prefix(' ')?;
    let mut chars = flags.chars();
    let update = chars.next()?;
    let kind = chars.next()?;
    if !"<>ch.*".contains(update) || !"fdLDS".contains(kind) || name.is_empty() {
        return None;
    }
    Some((flags, name.trim_end()))
}

/// ` 1,234 (reg: 1,000, dir: 234)` counts regular files when broken down.
fn parse_file_count(text: &str) -> Option<u64> {
    if let Some((_, rest)) = text.split_once("reg:") {
        let count = rest.split(')').next()?.split(", ").next()?;
        return parse_grouped(count.trim());
    }
    parse_grouped(text.split_whitespace().next()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobConfig, JobSettings};
    use chrono::Utc;

    fn job(settings: JobSettings) -> Job {
        Job::from_config(
            JobConfig {
                name: "photos".into(),
                source: "backup@nas:/srv/photos".into(),
                dest: "/backup/photos".into(),
                transfer_type: TransferType::Rsync,
                settings,
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_progress2_line() {
        let event = Rsync::parse_line("      1,234,567  45%    1.50MB/s    0:01:02 (xfr#3, to-chk=7/12)");
        let Some(ToolEvent::Stats(stats)) = event.clone() else {
            panic!("expected stats, got {:?}", event);
        };
        assert_eq!(stats.bytes, 1_234_567);
        assert_eq!(stats.percent, Some(45.0));
        assert_eq!(stats.speed, 1.5 * 1024.0 * 1024.0);
        assert_eq!(stats.eta_seconds, Some(62));
        assert_eq!(stats.transfers, Some(3));
    }

    #[test]
    fn test_progress2_line_without_transfer_count() {
        let Some(ToolEvent::Stats(stats)) = Rsync::parse_line("  32,768   0%    0.00kB/s    0:00:00") else {
            panic!("expected stats");
        };
        assert_eq!(stats.bytes, 32_768);
        assert_eq!(stats.transfers, None);
    }

    #[test]
    fn test_out_format_lines() {
        assert_eq!(
            Rsync::parse_line("FILE:4,096:albums/2023/cover.jpg"),
            Some(ToolEvent::FileTransferred {
                name: "albums/2023/cover.jpg".into(),
                size: 4096
            })
        );
        assert_eq!(Rsync::parse_line("FILE:4096:albums/"), Some(ToolEvent::Other));
        assert_eq!(Rsync::parse_line("FILE:x:broken"), None);
    }

    #[test]
    fn test_error_lines_and_noise() {
        assert!(matches!(
            Rsync::parse_line("rsync error: error in rsync protocol data stream (code 12) at io.c(228)"),
            Some(ToolEvent::Error(_))
        ));
        assert!(matches!(
            Rsync::parse_line("ssh: connect to host nas port 22: Connection refused"),
            Some(ToolEvent::Error(_))
        ));
        assert_eq!(Rsync::parse_line("sending incremental file list"), None);
        assert_eq!(Rsync::parse_line(""), None);
    }

    #[test]
    fn test_transient_exit_codes() {
        for code in [10, 12, 30, 35] {
            assert!(Rsync::is_transient_exit(code));
        }
        assert!(!Rsync::is_transient_exit(23), "partial transfer is not a network failure");
        assert!(!Rsync::is_transient_exit(1));
    }

    #[test]
    fn test_transfer_args() {
        let mut settings = JobSettings::default();
        settings.bandwidth_limit = Some(2048);
        settings.verification_mode = VerificationMode::Checksum;
        let args = Rsync::transfer_args(&job(settings), true);

        assert!(args.contains(&"--partial".to_string()));
        assert!(args.contains(&"--bwlimit=2048".to_string()));
        assert!(args.contains(&"--checksum".to_string()));
        assert!(args.contains(&"--remove-source-files".to_string()));
        assert_eq!(args[args.len() - 2], "backup@nas:/srv/photos/");
        assert_eq!(args[args.len() - 1], "/backup/photos");

        let plain = Rsync::transfer_args(&job(JobSettings::default()), false);
        assert!(!plain.contains(&"--remove-source-files".to_string()));
        assert!(!plain.contains(&"--checksum".to_string()));
    }

    #[test]
    fn test_validate_locations() {
        assert!(Rsync::validate_location("/data/photos").is_ok());
        assert!(Rsync::validate_location("backup@nas:/srv").is_ok());
        assert!(Rsync::validate_location("rsync://mirror/pub").is_ok());
        assert!(Rsync::validate_location("rsync:///pub").is_err());
        assert!(Rsync::validate_location("@nas:/srv").is_err());
        assert!(Rsync::validate_location("--delete").is_err());
        assert!(Rsync::validate_pair("a@b:/x", "c@d:/y").is_err());
        assert!(Rsync::validate_pair("/x", "c@d:/y").is_ok());
    }

    #[test]
    fn test_parse_verify_counts_changed_files() {
        let stdout = "\
.d          ./
>f+++++++++ new.txt
>fcst...... changed.txt
.f...p..... perms-only.txt
.f          same name.txt
cd+++++++++ newdir/

Number of files: 6 (reg: 4, dir: 2)
Number of regular files transferred: 2
";
        let report = Rsync::parse_verify(Some(0), stdout, "").expect("parse");
        assert_eq!(report.mismatches, 2);
        assert_eq!(report.files_checked, 4);
        assert_eq!(report.mismatched, vec!["new.txt".to_string(), "changed.txt".to_string()]);
        assert_eq!(
            report.verified,
            vec![VerifiedFile::named("perms-only.txt"), VerifiedFile::named("same name.txt")]
        );
    }

    #[test]
    fn test_delete_source_args_name_the_verified_list() {
        let mut settings = JobSettings::default();
        settings.verification_mode = VerificationMode::Checksum;
        let args = Rsync::delete_source_args(&job(settings), true, Path::new("/tmp/shuttle-files-x"));
        assert_eq!(
            args,
            vec![
                "--archive",
                "--remove-source-files",
                "--from0",
                "--files-from=/tmp/shuttle-files-x",
                "--checksum",
                "backup@nas:/srv/photos/",
                "/backup/photos",
            ]
        );
    }

    #[test]
    fn test_list_root_of_a_single_file_is_its_parent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("archive.tar");
        std::fs::write(&file, b"tar").expect("write");
        let file = file.to_str().expect("utf8 path");

        assert_eq!(list_root(file), format!("{}/", temp_dir.path().display()));
        assert_eq!(list_root("nas:/srv/photos"), "nas:/srv/photos/");
    }

    #[test]
    fn test_parse_verify_clean_tree() {
        let report = Rsync::parse_verify(Some(0), "Number of files: 1,204 (reg: 1,200, dir: 4)\n", "")
            .expect("parse");
        assert!(report.passed());
        assert_eq!(report.files_checked, 1200);
    }

    #[test]
    fn test_parse_verify_failure_is_error() {
        let err = Rsync::parse_verify(Some(12), "", "rsync: connection unexpectedly closed\n")
            .expect_err("non-zero exit");
        assert!(err.contains("code 12"));
    }

    #[test]
    fn test_cleanup_command_uses_ssh() {
        let tools = ToolsConfig::default();
        let (binary, args) = Rsync::cleanup_command(&job(JobSettings::default()), &tools).expect("ssh source");
        assert_eq!(binary, PathBuf::from("ssh"));
        assert_eq!(args[0], "backup@nas");
        assert_eq!(args[1], "find '/srv/photos' -mindepth 1 -type d -empty -delete");
    }
}
