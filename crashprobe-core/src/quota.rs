//! Storage-quota admission for sender output directories.

use crate::fsutil;
use std::path::Path;
use tracing::debug;

/// Space-availability predicate, a seam so deployments can substitute a
/// filesystem-level (statvfs) check and tests can force denial.
pub trait SpaceChecker: Send {
    /// Whether writes to `outdir` are still within `quota_bytes`.
    fn available(&self, outdir: &Path, quota_bytes: u64) -> bool;
}

/// Default checker: recursive usage of the output directory against the
/// byte budget.
#[derive(Debug, Default, Clone)]
pub struct DirUsageChecker;

impl SpaceChecker for DirUsageChecker {
    fn available(&self, outdir: &Path, quota_bytes: u64) -> bool {
        let used = fsutil::dir_size(outdir);
        debug!(outdir = %outdir.display(), used, quota_bytes, "quota check");
        used < quota_bytes
    }
}
