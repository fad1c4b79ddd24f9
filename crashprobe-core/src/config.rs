//! Configuration model for the agent.
//!
//! The configuration is loaded once at startup and is immutable for the
//! process lifetime. Runtime state that senders own (uptime checkpoints,
//! build fingerprints, VM cursors) lives outside this module.

use crate::error::{ProbeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How one diagnostic log is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// Regular file; optionally only the last N lines.
    File,
    /// Device or other special node; drained to end-of-stream.
    Node,
    /// Shell command; standard output is captured.
    Cmd,
}

impl LogKind {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Node => "node",
            Self::Cmd => "cmd",
        }
    }
}

/// A configured description of one diagnostic artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSpec {
    pub name: String,
    pub kind: LogKind,
    /// Source path, glob pattern, or command line depending on `kind`.
    pub path: String,
    /// Collect only the last N lines (File kind only).
    #[serde(default)]
    pub lines: Option<usize>,
}

impl LogSpec {
    /// Whether the destination filename needs an uptime suffix so repeated
    /// collections do not overwrite each other.
    pub fn needs_timestamp(&self) -> bool {
        self.kind == LogKind::Cmd || self.lines.is_some()
    }
}

/// What kind of filesystem object triggers a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Dir,
    File,
}

/// The filesystem trigger of a crash definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub kind: TriggerKind,
    pub path: PathBuf,
}

/// A crash definition, possibly refined by more specific children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashSpec {
    pub name: String,
    #[serde(default)]
    pub trigger: Option<TriggerSpec>,
    /// Names of logs collected when this crash fires.
    #[serde(default)]
    pub logs: Vec<String>,
    /// Substrings that must all appear in the trigger content for this
    /// (child) crash to match.
    #[serde(default)]
    pub content: Vec<String>,
    /// Line prefixes whose remainders become the auxiliary data fields.
    #[serde(default)]
    pub data: Vec<String>,
    /// More specific crash definitions checked against the trigger content.
    #[serde(default)]
    pub children: Vec<CrashSpec>,
}

/// An informational event definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoSpec {
    pub name: String,
    #[serde(default)]
    pub logs: Vec<String>,
}

/// A guest VM whose event stream is reconciled against the host's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    /// Root of the guest filesystem image accessor.
    pub image: PathBuf,
    /// Guest-relative path of the event stream to synchronize.
    pub event_stream: String,
}

/// Uptime milestone tracking for one sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UptimeConfig {
    /// Checkpoint interval in hours.
    pub interval_hours: u64,
    /// Checkpoint file touched at startup so upstream watchers can follow it.
    pub path: PathBuf,
}

/// Remote telemetry binding for one sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Namespace prefixed to every class string.
    pub namespace: String,
    /// Collector endpoint for the default HTTP transport.
    pub endpoint: String,
}

/// Which pipeline a sender runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    /// Local archive of collected logs plus the audit history.
    Crashlog,
    /// Remote forwarding of already-collected material.
    Telemetry,
}

impl SenderKind {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crashlog => "crashlog",
            Self::Telemetry => "telemetry",
        }
    }
}

/// One independent output pipeline with its own storage budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    pub name: String,
    pub kind: SenderKind,
    pub outdir: PathBuf,
    /// Storage budget in bytes for `outdir`.
    pub quota_bytes: u64,
    #[serde(default)]
    pub uptime: Option<UptimeConfig>,
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Build fingerprint of the running system, used for update detection.
    #[serde(default = "default_build_version")]
    pub build_version: String,
    /// File holding the boot/startup reason token.
    #[serde(default)]
    pub startup_reason_file: Option<PathBuf>,
    #[serde(default)]
    pub logs: Vec<LogSpec>,
    #[serde(default)]
    pub crashes: Vec<CrashSpec>,
    #[serde(default)]
    pub infos: Vec<InfoSpec>,
    #[serde(default)]
    pub vms: Vec<VmSpec>,
    pub senders: Vec<SenderConfig>,
}

fn default_build_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ProbeError::InvalidConfig {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ProbeError::InvalidConfig {
                reason: format!("failed to parse {}: {}", path.display(), e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipelines cannot run against.
    pub fn validate(&self) -> Result<()> {
        if self.senders.is_empty() {
            return Err(ProbeError::InvalidConfig { reason: "no senders configured".into() });
        }
        for sender in &self.senders {
            if sender.kind == SenderKind::Telemetry && sender.telemetry.is_none() {
                return Err(ProbeError::InvalidConfig {
                    reason: format!("telemetry sender {} has no telemetry binding", sender.name),
                });
            }
        }
        for crash in &self.crashes {
            self.check_log_refs(&crash.name, &crash.logs)?;
        }
        for info in &self.infos {
            self.check_log_refs(&info.name, &info.logs)?;
        }
        Ok(())
    }

    fn check_log_refs(&self, owner: &str, logs: &[String]) -> Result<()> {
        for name in logs {
            if self.log_by_name(name).is_none() {
                return Err(ProbeError::InvalidConfig {
                    reason: format!("{} references unknown log {}", owner, name),
                });
            }
        }
        Ok(())
    }

    pub fn log_by_name(&self, name: &str) -> Option<&LogSpec> {
        self.logs.iter().find(|log| log.name == name)
    }

    pub fn crash_by_name(&self, name: &str) -> Option<&CrashSpec> {
        self.crashes.iter().find(|crash| crash.name == name)
    }

    pub fn info_by_name(&self, name: &str) -> Option<&InfoSpec> {
        self.infos.iter().find(|info| info.name == name)
    }

    pub fn vm_by_name(&self, name: &str) -> Option<&VmSpec> {
        self.vms.iter().find(|vm| vm.name == name)
    }

    pub fn sender_by_name(&self, name: &str) -> Option<&SenderConfig> {
        self.senders.iter().find(|sender| sender.name == name)
    }

    /// First sender of the given kind, if any. The crashlog sender is looked
    /// up this way by the telemetry pipeline when locating archived VM logs.
    pub fn sender_by_kind(&self, kind: SenderKind) -> Option<&SenderConfig> {
        self.senders.iter().find(|sender| sender.kind == kind)
    }
}
