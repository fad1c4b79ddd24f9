//! Filesystem and process primitives used by the collection pipeline.
//!
//! Everything here operates on one file or directory at a time and reports
//! failures through [`ProbeError`]; callers decide whether a failure aborts
//! anything beyond the single artifact being handled.

use crate::error::{ProbeError, Result};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// Snapshot-copy the full current contents of `src` into `dest`.
///
/// The destination is truncated first; a source that grows or shrinks while
/// being read yields whatever `io::copy` observed, which is acceptable for
/// log snapshots.
pub fn snapshot_copy(src: &Path, dest: &Path) -> Result<u64> {
    let mut from = File::open(src).map_err(|e| ProbeError::io(src, e))?;
    let mut to = File::create(dest).map_err(|e| ProbeError::io(dest, e))?;
    io::copy(&mut from, &mut to).map_err(|e| ProbeError::io(dest, e))
}

/// Copy `src` to `dest` by reading until end-of-stream.
///
/// Device and other special nodes do not report a meaningful size, so this
/// never consults metadata and simply drains the stream.
pub fn drain_copy(src: &Path, dest: &Path) -> Result<u64> {
    let mut from = File::open(src).map_err(|e| ProbeError::io(src, e))?;
    let mut to = File::create(dest).map_err(|e| ProbeError::io(dest, e))?;
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = from.read(&mut buf).map_err(|e| ProbeError::io(src, e))?;
        if n == 0 {
            break;
        }
        to.write_all(&buf[..n]).map_err(|e| ProbeError::io(dest, e))?;
        total += n as u64;
    }
    Ok(total)
}

/// Count lines in a byte buffer. A trailing fragment without a newline
/// counts as a line, so `b"a\nb"` and `b"a\nb\n"` are both two lines.
pub fn count_lines(content: &[u8]) -> usize {
    if content.is_empty() {
        return 0;
    }
    let newlines = content.iter().filter(|&&b| b == b'\n').count();
    if content.ends_with(b"\n") {
        newlines
    } else {
        newlines + 1
    }
}

/// Byte offset of the start of 1-based line `line`. Offsets past the last
/// line saturate to the buffer length.
pub fn line_offset(content: &[u8], line: usize) -> usize {
    if line <= 1 {
        return 0;
    }
    let mut remaining = line - 1;
    for (i, &b) in content.iter().enumerate() {
        if b == b'\n' {
            remaining -= 1;
            if remaining == 0 {
                return i + 1;
            }
        }
    }
    content.len()
}

/// Execute `cmd` through the shell, capturing its standard output verbatim
/// into `dest`. Standard error is discarded. Returns the exit status so the
/// caller can log non-zero exits.
pub fn exec_to_file(cmd: &str, dest: &Path) -> Result<ExitStatus> {
    let out = File::create(dest).map_err(|e| ProbeError::io(dest, e))?;
    Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::from(out))
        .stderr(Stdio::null())
        .status()
        .map_err(|e| ProbeError::CommandFailed { command: cmd.to_string(), reason: e.to_string() })
}

/// Whether a configured source path is a glob pattern rather than one file.
pub fn is_pattern(path: &str) -> bool {
    path.contains(['*', '?', '['])
}

/// Expand a glob pattern into the concrete files it currently matches.
/// Unreadable entries are skipped; an empty result is not an error.
pub fn expand_pattern(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob::glob(pattern).map_err(|e| ProbeError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;
    Ok(paths.filter_map(|entry| entry.ok()).collect())
}

/// Search `root` up to `max_depth` levels deep for a directory whose name
/// contains `needle`. Returns the first match in traversal order.
pub fn find_dir_substr(root: &Path, needle: &str, max_depth: usize) -> Option<PathBuf> {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| {
            entry.file_type().is_dir() && entry.file_name().to_string_lossy().contains(needle)
        })
        .map(|entry| entry.into_path())
}

/// Recursive byte usage of a directory tree. Unreadable entries count as zero.
pub fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}

/// Regular files directly under `dir`, sorted by name.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| ProbeError::io(dir, e))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    files.sort();
    Ok(files)
}
