//! Host platform glue: build fingerprint tracking and the startup reason.

use crate::error::{ProbeError, Result};
use std::path::{Path, PathBuf};
use tracing::info;

const BUILD_PROP: &str = "build.prop";

/// Fallback startup reason when the source is absent or unreadable.
pub const UNKNOWN_REASON: &str = "UNKNOWN";

/// Per-sender persisted properties, currently just the build fingerprint
/// used to detect software updates across reboots.
#[derive(Debug, Clone)]
pub struct Properties {
    path: PathBuf,
    swupdated: bool,
}

impl Properties {
    /// Load the fingerprint recorded under `outdir`, compare it to the
    /// running build, and record the current one. The first run records
    /// without firing the update predicate.
    pub fn init(outdir: &Path, current_version: &str) -> Result<Self> {
        let path = outdir.join(BUILD_PROP);
        let previous = match std::fs::read_to_string(&path) {
            Ok(content) => Some(content.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(ProbeError::io(&path, e)),
        };
        let swupdated = matches!(&previous, Some(prev) if prev != current_version);
        if swupdated {
            info!(
                "software update detected: {} -> {}",
                previous.as_deref().unwrap_or_default(),
                current_version
            );
        }
        std::fs::write(&path, format!("{current_version}\n"))
            .map_err(|e| ProbeError::io(&path, e))?;
        Ok(Self { path, swupdated })
    }

    /// Whether the build fingerprint changed since the previous run.
    pub fn swupdated(&self) -> bool {
        self.swupdated
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read the boot/startup reason: first whitespace-trimmed token of the
/// configured file, `UNKNOWN` on any failure.
pub fn startup_reason(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return UNKNOWN_REASON.to_string();
    };
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.split_whitespace().next().map(str::to_string))
        .unwrap_or_else(|| UNKNOWN_REASON.to_string())
}
