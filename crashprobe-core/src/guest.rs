//! Read-only access into guest filesystem images.
//!
//! The real accessor for a production deployment wraps whatever filesystem
//! the guest image uses; [`DirImage`] maps a host directory as the guest
//! root, which is what development setups and tests run against.

use crate::error::{ProbeError, Result};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Successful dump: how many entries were materialized on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpReport {
    pub copied: usize,
}

/// Failed dump with partial progress. `copied == 0` means nothing was
/// materialized, which callers treat as "the guest directory is missing".
#[derive(Debug, Error)]
#[error("dump aborted after {copied} entries: {source}")]
pub struct DumpError {
    pub copied: usize,
    #[source]
    pub source: ProbeError,
}

/// Accessor into one guest's filesystem image.
pub trait GuestImage: Send {
    /// Read a guest-relative file as text.
    fn read_file(&self, dpath: &str) -> Result<String>;

    /// Dump every entry under the guest-relative directory `dpath` into
    /// `dest/<basename(dpath)>/`, reporting partial progress on failure.
    fn dump_dir(&self, dpath: &str, dest: &Path) -> std::result::Result<DumpReport, DumpError>;
}

/// Guest image backed by a host directory tree.
#[derive(Debug, Clone)]
pub struct DirImage {
    root: PathBuf,
}

impl DirImage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, dpath: &str) -> PathBuf {
        self.root.join(dpath.trim_start_matches('/'))
    }
}

impl GuestImage for DirImage {
    fn read_file(&self, dpath: &str) -> Result<String> {
        let path = self.resolve(dpath);
        std::fs::read_to_string(&path).map_err(|e| ProbeError::io(path, e))
    }

    fn dump_dir(&self, dpath: &str, dest: &Path) -> std::result::Result<DumpReport, DumpError> {
        let src_root = self.resolve(dpath);
        if !src_root.is_dir() {
            return Err(DumpError {
                copied: 0,
                source: ProbeError::GuestPathNotFound { dpath: dpath.to_string() },
            });
        }

        let basename = src_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "logs".to_string());
        let dest_root = dest.join(basename);

        let mut copied = 0usize;
        for entry in walkdir::WalkDir::new(&src_root).min_depth(1) {
            let entry = entry.map_err(|e| DumpError {
                copied,
                source: ProbeError::Internal(format!("walk {}: {}", src_root.display(), e)),
            })?;
            let rel = entry
                .path()
                .strip_prefix(&src_root)
                .map_err(|e| DumpError { copied, source: ProbeError::Internal(e.to_string()) })?;
            let target = dest_root.join(rel);
            let result: Result<()> = if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target).map_err(|e| ProbeError::io(&target, e))
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| ProbeError::io(parent, e))
                        .and_then(|_| {
                            std::fs::copy(entry.path(), &target)
                                .map(|_| ())
                                .map_err(|e| ProbeError::io(&target, e))
                        })
                } else {
                    Ok(())
                }
            };
            result.map_err(|source| DumpError { copied, source })?;
            copied += 1;
        }

        debug!("dumped {} entries from ({}) to ({})", copied, dpath, dest_root.display());
        Ok(DumpReport { copied })
    }
}
