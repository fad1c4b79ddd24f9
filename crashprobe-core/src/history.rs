//! Append-only audit trail of handled events.
//!
//! One line per handled event, fixed-width columns, never mutated or
//! deleted. The same five-field shape (tag, key, time, subject, rest) is
//! what guest VMs write into their own event streams, which keeps the two
//! sides of the VM synchronizer symmetric.

use crate::error::{ProbeError, Result};
use crate::keys;
use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

const HISTORY_HEADER: &str = "#V1.0 CRASHPROBE:EVENTS";
const TIME_FORMAT: &str = "%Y-%m-%d/%H:%M:%S";

/// One record of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub tag: String,
    pub key: String,
    pub subject: String,
    pub dir: Option<PathBuf>,
    pub annotation: String,
}

impl HistoryRecord {
    fn render(&self) -> String {
        let location = match &self.dir {
            Some(dir) => dir.display().to_string(),
            None => "-".to_string(),
        };
        let mut line = format!(
            "{:<8}{:<24}{:<22}{:<20}{}",
            self.tag,
            self.key,
            Local::now().format(TIME_FORMAT),
            self.subject,
            location
        );
        if !self.annotation.is_empty() {
            line.push(' ');
            line.push_str(&self.annotation);
        }
        line
    }
}

/// Append-only writer for the history file.
#[derive(Debug, Clone)]
pub struct EventRecorder {
    path: PathBuf,
}

impl EventRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the history file with its header if it does not exist yet.
    /// Startup-time failure here is fatal to the agent.
    pub fn prepare(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProbeError::io(parent, e))?;
        }
        std::fs::write(&self.path, format!("{HISTORY_HEADER}\n"))
            .map_err(|e| ProbeError::io(&self.path, e))
    }

    fn append(&self, record: &HistoryRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ProbeError::io(&self.path, e))?;
        writeln!(file, "{}", record.render()).map_err(|e| ProbeError::io(&self.path, e))
    }

    /// Append one record under a key assigned earlier in the pipeline
    /// (after classification, so the recorded subject is the classified one).
    pub fn raise_event_with_key(
        &self,
        tag: &str,
        subject: &str,
        dir: Option<&Path>,
        annotation: &str,
        key: &str,
    ) -> Result<()> {
        self.append(&HistoryRecord {
            tag: tag.to_string(),
            key: key.to_string(),
            subject: subject.to_string(),
            dir: dir.map(Path::to_path_buf),
            annotation: annotation.to_string(),
        })
    }

    /// Generate a new unique key, append one record, and return the key for
    /// reuse in any telemetry forwarding of the same logical event.
    pub fn raise_event(
        &self,
        tag: &str,
        subject: &str,
        dir: Option<&Path>,
        annotation: &str,
    ) -> Result<String> {
        let key = keys::event_key(tag, subject);
        self.raise_event_with_key(tag, subject, dir, annotation, &key)?;
        Ok(key)
    }

    /// Record a system condition (e.g. storage exhaustion) carrying no
    /// directory. Failures are logged, not propagated; losing one info
    /// record must not abort the event being processed.
    pub fn raise_infoerror(&self, code: &str) {
        if let Err(e) = self.raise_event("INFO", code, None, "") {
            warn!("failed to record {} info event: {}", code, e);
        }
    }

    /// Record an uptime checkpoint.
    pub fn raise_uptime(&self, uptime: &str) -> Result<String> {
        self.raise_event("UPTIME", uptime, None, "")
    }
}

/// Write the crash descriptor file into a newly generated event directory.
pub fn write_crashfile(
    dir: &Path,
    event: &str,
    key: &str,
    kind: &str,
    data: [Option<&str>; 3],
) -> Result<()> {
    let path = dir.join("crashfile");
    let mut content = format!("EVENT={event}\nID={key}\nTYPE={kind}\n");
    for (i, field) in data.iter().enumerate() {
        if let Some(value) = field {
            content.push_str(&format!("DATA{i}={value}\n"));
        }
    }
    std::fs::write(&path, content).map_err(|e| ProbeError::io(&path, e))
}
