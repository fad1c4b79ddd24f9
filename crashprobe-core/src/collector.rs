//! Log collection: fetching one configured log into an archive directory.
//!
//! Failures never propagate past the single log (or single matched source
//! file) being fetched; siblings always proceed.

use crate::config::{LogKind, LogSpec};
use crate::error::Result;
use crate::fsutil;
use crate::uptime;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, warn};

/// Fetches taking at least this long are logged at warn level.
const SLOW_FETCH_SECS: u64 = 5;

/// Compute the destination path for one fetched log.
///
/// Pattern-expanding sources keep the matched file's basename; everything
/// else uses the configured log name. Cmd-kind and tailed logs get an
/// `_<uptime>` suffix so repeated collections do not overwrite each other;
/// plain File/Node logs deliberately do overwrite.
pub fn log_path(log: &LogSpec, src_name: &str, dest_dir: &Path) -> PathBuf {
    let filename = if fsutil::is_pattern(&log.path) { src_name } else { &log.name };
    if log.needs_timestamp() {
        let stamp = uptime::uptime().map(uptime::render).unwrap_or_else(|_| "0:00:00".into());
        dest_dir.join(format!("{filename}_{stamp}"))
    } else {
        dest_dir.join(filename.to_string())
    }
}

/// Fetch one configured log into `dest_dir`, expanding source patterns.
///
/// Every failure is logged and isolated to the source file it occurred on.
pub fn collect(log: &LogSpec, dest_dir: &Path) {
    let started = Instant::now();

    // A Cmd source is a command line, not a path; never expand it.
    if log.kind != LogKind::Cmd && fsutil::is_pattern(&log.path) {
        match fsutil::expand_pattern(&log.path) {
            Err(e) => error!("expand ({}) failed: {}", log.path, e),
            Ok(files) if files.is_empty() => warn!("no logs found for ({})", log.name),
            Ok(files) => {
                for src in files {
                    let Some(name) = src.file_name().map(|n| n.to_string_lossy().into_owned())
                    else {
                        error!("invalid path ({}) in log ({})", src.display(), log.name);
                        continue;
                    };
                    let dest = log_path(log, &name, dest_dir);
                    if let Err(e) = fetch(log, &src, &dest) {
                        error!("get ({}) from ({}) failed: {}", log.name, src.display(), e);
                    }
                }
            }
        }
    } else {
        let dest = log_path(log, &log.name, dest_dir);
        if let Err(e) = fetch(log, Path::new(&log.path), &dest) {
            error!("get ({}) from ({}) failed: {}", log.name, log.path, e);
        }
    }

    let spent = started.elapsed().as_secs();
    if spent < SLOW_FETCH_SECS {
        debug!("get ({}) spent {}s", log.name, spent);
    } else {
        warn!("get ({}) spent {}s", log.name, spent);
    }
}

fn fetch(log: &LogSpec, src: &Path, dest: &Path) -> Result<()> {
    match log.kind {
        LogKind::File => match log.lines {
            Some(lines) if lines > 0 => fetch_tail(src, dest, lines),
            _ => fsutil::snapshot_copy(src, dest).map(|_| ()),
        },
        LogKind::Node => fsutil::drain_copy(src, dest).map(|_| ()),
        LogKind::Cmd => {
            let status = fsutil::exec_to_file(&log.path, dest)?;
            if !status.success() {
                warn!("cmd ({}) exited with {}", log.path, status);
            }
            Ok(())
        }
    }
}

/// Extract the last `lines` lines of `src` into a new file at `dest`.
///
/// An empty source is logged and skipped; it is not an error.
fn fetch_tail(src: &Path, dest: &Path, lines: usize) -> Result<()> {
    let content = std::fs::read(src).map_err(|e| crate::error::ProbeError::io(src, e))?;
    let total = fsutil::count_lines(&content);
    if total == 0 {
        warn!("get lines ({}, 0) failed", src.display());
        return Ok(());
    }
    let start_line = total.saturating_sub(lines) + 1;
    let offset = fsutil::line_offset(&content, start_line);
    std::fs::write(dest, &content[offset..]).map_err(|e| crate::error::ProbeError::io(dest, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_log(name: &str, path: &str, lines: Option<usize>) -> LogSpec {
        LogSpec { name: name.into(), kind: LogKind::File, path: path.into(), lines }
    }

    #[test]
    fn test_log_path_suffix_rules() {
        let dir = tempfile::tempdir().unwrap();
        let plain = file_log("messages", "/var/log/messages", None);
        assert_eq!(log_path(&plain, "messages", dir.path()), dir.path().join("messages"));

        let tailed = file_log("messages", "/var/log/messages", Some(10));
        let tailed_name =
            log_path(&tailed, "messages", dir.path()).file_name().unwrap().to_string_lossy().into_owned();
        assert!(tailed_name.starts_with("messages_"));

        let cmd = LogSpec { name: "ps".into(), kind: LogKind::Cmd, path: "ps -ef".into(), lines: None };
        let cmd_name =
            log_path(&cmd, "ps", dir.path()).file_name().unwrap().to_string_lossy().into_owned();
        assert!(cmd_name.starts_with("ps_"));
    }

    #[test]
    fn test_log_path_uses_source_basename_for_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let log = file_log("vmlogs", "/var/log/vm*.log", None);
        assert_eq!(log_path(&log, "vm3.log", dir.path()), dir.path().join("vm3.log"));
    }

    #[test]
    fn test_collect_whole_file() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("messages");
        std::fs::write(&src, "one\ntwo\n").unwrap();
        let log = file_log("messages", src.to_str().unwrap(), None);
        collect(&log, dest_dir.path());
        assert_eq!(
            std::fs::read_to_string(dest_dir.path().join("messages")).unwrap(),
            "one\ntwo\n"
        );
    }

    #[test]
    fn test_collect_tail_lines() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("log");
        std::fs::write(&src, "1\n2\n3\n4\n5\n").unwrap();
        let log = file_log("log", src.to_str().unwrap(), Some(2));
        collect(&log, dest_dir.path());
        let produced = fsutil::list_files(dest_dir.path()).unwrap();
        assert_eq!(produced.len(), 1);
        assert_eq!(std::fs::read_to_string(&produced[0]).unwrap(), "4\n5\n");
    }

    #[test]
    fn test_collect_tail_larger_than_file_copies_all() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("log");
        std::fs::write(&src, "1\n2\n").unwrap();
        let log = file_log("log", src.to_str().unwrap(), Some(100));
        collect(&log, dest_dir.path());
        let produced = fsutil::list_files(dest_dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&produced[0]).unwrap(), "1\n2\n");
    }

    #[test]
    fn test_collect_pattern_per_match() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("vm0.log"), "a").unwrap();
        std::fs::write(src_dir.path().join("vm1.log"), "b").unwrap();
        let pattern = format!("{}/vm*.log", src_dir.path().display());
        let log = file_log("vmlogs", &pattern, None);
        collect(&log, dest_dir.path());
        assert!(dest_dir.path().join("vm0.log").exists());
        assert!(dest_dir.path().join("vm1.log").exists());
    }

    #[test]
    fn test_collect_missing_source_is_isolated() {
        let dest_dir = tempfile::tempdir().unwrap();
        let log = file_log("gone", "/nonexistent/gone", None);
        collect(&log, dest_dir.path());
        assert!(fsutil::list_files(dest_dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_collect_cmd_output() {
        let dest_dir = tempfile::tempdir().unwrap();
        let log = LogSpec {
            name: "echo".into(),
            kind: LogKind::Cmd,
            path: "printf 'captured'".into(),
            lines: None,
        };
        collect(&log, dest_dir.path());
        let produced = fsutil::list_files(dest_dir.path()).unwrap();
        assert_eq!(produced.len(), 1);
        assert_eq!(std::fs::read_to_string(&produced[0]).unwrap(), "captured");
    }
}
