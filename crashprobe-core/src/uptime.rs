//! Monotonic boot-time reading and the per-sender uptime checkpoint state.

use crate::error::{ProbeError, Result};
use std::path::Path;
use std::time::Duration;

/// Read the host uptime with second granularity.
///
/// Linux exposes seconds-since-boot as the first field of `/proc/uptime`.
pub fn uptime() -> Result<Duration> {
    read_uptime_from(Path::new("/proc/uptime"))
}

fn read_uptime_from(path: &Path) -> Result<Duration> {
    let content = std::fs::read_to_string(path).map_err(|e| ProbeError::io(path, e))?;
    let secs = content
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .ok_or_else(|| ProbeError::Internal(format!("malformed uptime in {}", path.display())))?;
    Ok(Duration::from_secs(secs as u64))
}

/// Render an uptime as `H:MM:SS` with unpadded hours.
pub fn render(up: Duration) -> String {
    let secs = up.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Current uptime rendered as `H:MM:SS`, together with whole hours since boot.
pub fn uptime_string() -> Result<(String, u64)> {
    let up = uptime()?;
    Ok((render(up), up.as_secs() / 3600))
}

/// Checkpoint state for uptime milestone events, owned by one sender.
///
/// The counter starts at the first interval and only ever moves forward, so
/// each crossed multiple of the checkpoint interval fires exactly once per
/// process lifetime.
#[derive(Debug, Clone)]
pub struct UptimeState {
    next_multiple: u64,
}

impl Default for UptimeState {
    fn default() -> Self {
        Self { next_multiple: 1 }
    }
}

impl UptimeState {
    /// Advance against the current uptime; returns true when a new multiple
    /// of `interval_hours` has been crossed since the last firing.
    pub fn advance(&mut self, hours: u64, interval_hours: u64) -> bool {
        if interval_hours == 0 {
            return false;
        }
        let crossed = hours / interval_hours;
        if crossed >= self.next_multiple {
            self.next_multiple = crossed + 1;
            true
        } else {
            false
        }
    }
}
