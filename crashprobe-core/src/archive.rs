//! Archive directory allocation under a sender's output directory.

use crate::error::{ProbeError, Result};
use std::path::PathBuf;

/// Processing mode an archive directory is allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Crash,
    Stats,
    VmEvent,
}

impl Mode {
    /// Directory name prefix for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::Stats => "stats",
            Self::VmEvent => "vmevent",
        }
    }
}

const MODES: [Mode; 3] = [Mode::Crash, Mode::Stats, Mode::VmEvent];

/// Allocates `<outdir>/<mode><seq>_<key-prefix>` directories.
///
/// Sequence numbers continue from the highest existing entry per mode, so a
/// restarted agent never reuses a directory name.
#[derive(Debug)]
pub struct ArchiveAllocator {
    outdir: PathBuf,
    next_seq: [u64; 3],
}

impl ArchiveAllocator {
    /// Scan `outdir` once and resume sequence numbers past whatever exists.
    pub fn open(outdir: impl Into<PathBuf>) -> Result<Self> {
        let outdir = outdir.into();
        let mut next_seq = [0u64; 3];
        if outdir.exists() {
            let entries =
                std::fs::read_dir(&outdir).map_err(|e| ProbeError::io(&outdir, e))?;
            for entry in entries.filter_map(|entry| entry.ok()) {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                for (slot, mode) in MODES.iter().enumerate() {
                    if let Some(seq) = parse_seq(&name, mode.as_str()) {
                        next_seq[slot] = next_seq[slot].max(seq + 1);
                    }
                }
            }
        }
        Ok(Self { outdir, next_seq })
    }

    /// Allocate and create a fresh directory for one event.
    pub fn allocate(&mut self, mode: Mode, key: &str) -> Result<PathBuf> {
        let slot = MODES.iter().position(|m| *m == mode).unwrap_or(0);
        let seq = self.next_seq[slot];
        self.next_seq[slot] += 1;
        let prefix: String = key.chars().take(8).collect();
        let dir = self.outdir.join(format!("{}{}_{}", mode.as_str(), seq, prefix));
        std::fs::create_dir_all(&dir).map_err(|e| ProbeError::io(&dir, e))?;
        Ok(dir)
    }
}

fn parse_seq(name: &str, prefix: &str) -> Option<u64> {
    let rest = name.strip_prefix(prefix)?;
    let digits: &str = rest.split('_').next()?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_per_mode_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let mut alloc = ArchiveAllocator::open(dir.path()).unwrap();
        let first = alloc.allocate(Mode::Crash, "deadbeef00112233").unwrap();
        let second = alloc.allocate(Mode::Crash, "deadbeef00112233").unwrap();
        let stats = alloc.allocate(Mode::Stats, "cafe0000").unwrap();
        assert!(first.ends_with("crash0_deadbeef"));
        assert!(second.ends_with("crash1_deadbeef"));
        assert!(stats.ends_with("stats0_cafe0000"));
        assert!(first.is_dir() && second.is_dir() && stats.is_dir());
    }

    #[test]
    fn test_resumes_past_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("crash7_aaaaaaaa")).unwrap();
        std::fs::create_dir(dir.path().join("vmevent2_bbbbbbbb")).unwrap();
        let mut alloc = ArchiveAllocator::open(dir.path()).unwrap();
        assert!(alloc.allocate(Mode::Crash, "cc").unwrap().ends_with("crash8_cc"));
        assert!(alloc.allocate(Mode::VmEvent, "dd").unwrap().ends_with("vmevent3_dd"));
    }

    #[test]
    fn test_vmevent_prefix_does_not_bump_crash() {
        // "vmevent" shares no prefix with "crash"; make sure "stats" names do
        // not get misparsed either.
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("stats11_ee")).unwrap();
        let mut alloc = ArchiveAllocator::open(dir.path()).unwrap();
        assert!(alloc.allocate(Mode::Crash, "ff").unwrap().ends_with("crash0_ff"));
        assert!(alloc.allocate(Mode::Stats, "ff").unwrap().ends_with("stats12_ff"));
    }
}
