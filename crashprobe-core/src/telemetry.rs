//! Remote telemetry records and the transport seam.
//!
//! A record is sent at most once: a failed send is logged and surfaced to
//! the caller, never retried locally, and never rolls back the history
//! record already committed for the same logical event.

use crate::error::{ProbeError, Result};
use crate::fsutil;
use serde::Serialize;
use std::path::Path;
use tracing::error;

/// Severity attached to crash records.
pub const CRASH_SEVERITY: u32 = 4;
/// Severity attached to informational records.
pub const INFO_SEVERITY: u32 = 2;

const RECORD_VERSION: u32 = 1;

/// One remote-bound summary record.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub severity: u32,
    pub class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub payload: String,
    pub version: u32,
}

/// Transport seam for the remote collector wire format.
pub trait TelemetryTransport: Send {
    fn send(&self, record: &TelemetryRecord) -> Result<()>;
}

/// Default transport: one blocking JSON POST per record.
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), client: reqwest::blocking::Client::new() }
    }
}

impl TelemetryTransport for HttpTransport {
    fn send(&self, record: &TelemetryRecord) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(record)
            .send()
            .map_err(|e| ProbeError::TelemetrySendFailed { reason: e.to_string() })?;
        if !response.status().is_success() {
            return Err(ProbeError::TelemetrySendFailed {
                reason: format!("collector returned {}", response.status()),
            });
        }
        Ok(())
    }
}

/// Builds outbound records and hands them to the transport.
pub struct TelemetrySink<'a> {
    transport: &'a dyn TelemetryTransport,
}

impl<'a> TelemetrySink<'a> {
    pub fn new(transport: &'a dyn TelemetryTransport) -> Self {
        Self { transport }
    }

    /// Build and forward one record. Failure is logged and surfaced, never
    /// retried.
    pub fn send_data(
        &self,
        payload: &str,
        event_id: Option<&str>,
        severity: u32,
        class: &str,
    ) -> Result<()> {
        let record = TelemetryRecord {
            severity,
            class: class.to_string(),
            event_id: event_id.map(str::to_string),
            payload: payload.to_string(),
            version: RECORD_VERSION,
        };
        self.transport.send(&record).map_err(|e| {
            error!("failed to send record (class {}): {}", class, e);
            e
        })
    }

    /// Forward one collected log from an event's archive directory.
    ///
    /// Archived files are located by name-substring search; when the
    /// directory is absent or contains no match, a single "no logs" record
    /// is forwarded instead so the remote side still sees the event.
    pub fn forward_log(
        &self,
        srcdir: Option<&Path>,
        log_name: &str,
        event_id: Option<&str>,
        severity: u32,
        class: &str,
    ) {
        let Some(srcdir) = srcdir else {
            self.send_no_logs(log_name, event_id, severity, class);
            return;
        };

        let files = match fsutil::list_files(srcdir) {
            Ok(files) => files,
            Err(e) => {
                error!("search ({}) in dir ({}) failed: {}", log_name, srcdir.display(), e);
                return;
            }
        };

        let matched: Vec<_> = files
            .iter()
            .filter(|path| {
                path.file_name()
                    .map(|n| n.to_string_lossy().contains(log_name))
                    .unwrap_or(false)
            })
            .collect();

        if matched.is_empty() {
            error!("dir ({}) does not contain ({})", srcdir.display(), log_name);
            self.send_no_logs(log_name, event_id, severity, class);
            return;
        }

        for path in matched {
            let _ = self.send_data(&path.display().to_string(), event_id, severity, class);
        }
    }

    fn send_no_logs(&self, log_name: &str, event_id: Option<&str>, severity: u32, class: &str) {
        let msg = format!("no log generated on {log_name}, check probe's log.");
        let _ = self.send_data(&msg, event_id, severity, class);
    }
}

/// Class string for one event subject, e.g. `ns/crash/KERNEL`.
pub fn class_string(namespace: &str, kind: &str, subject: &str) -> String {
    format!("{namespace}/{kind}/{subject}")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Transport that records every record and can be told to fail.
    #[derive(Default)]
    pub struct MockTransport {
        pub sent: RefCell<Vec<TelemetryRecord>>,
        pub fail: bool,
    }

    impl TelemetryTransport for MockTransport {
        fn send(&self, record: &TelemetryRecord) -> Result<()> {
            if self.fail {
                return Err(ProbeError::TelemetrySendFailed { reason: "mock failure".into() });
            }
            self.sent.borrow_mut().push(record.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockTransport;
    use super::*;

    #[test]
    fn test_send_data_builds_record() {
        let transport = MockTransport::default();
        let sink = TelemetrySink::new(&transport);
        sink.send_data("payload", Some("id123"), CRASH_SEVERITY, "ns/crash/K").unwrap();
        let sent = transport.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, 4);
        assert_eq!(sent[0].class, "ns/crash/K");
        assert_eq!(sent[0].event_id.as_deref(), Some("id123"));
        assert_eq!(sent[0].payload, "payload");
    }

    #[test]
    fn test_send_failure_surfaces() {
        let transport = MockTransport { fail: true, ..Default::default() };
        let sink = TelemetrySink::new(&transport);
        assert!(sink.send_data("p", None, INFO_SEVERITY, "ns/info/X").is_err());
    }

    #[test]
    fn test_forward_log_matches_substring() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("messages_1:02:03"), "x").unwrap();
        std::fs::write(dir.path().join("other"), "y").unwrap();
        let transport = MockTransport::default();
        let sink = TelemetrySink::new(&transport);
        sink.forward_log(Some(dir.path()), "messages", None, INFO_SEVERITY, "ns/info/I");
        let sent = transport.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].payload.contains("messages_1:02:03"));
    }

    #[test]
    fn test_forward_log_without_dir_sends_no_logs() {
        let transport = MockTransport::default();
        let sink = TelemetrySink::new(&transport);
        sink.forward_log(None, "messages", None, INFO_SEVERITY, "ns/info/I");
        let sent = transport.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].payload.contains("no log generated on messages"));
    }

    #[test]
    fn test_forward_log_no_match_sends_no_logs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("unrelated"), "x").unwrap();
        let transport = MockTransport::default();
        let sink = TelemetrySink::new(&transport);
        sink.forward_log(Some(dir.path()), "messages", None, INFO_SEVERITY, "ns/info/I");
        let sent = transport.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].payload.contains("no log generated"));
    }

    #[test]
    fn test_class_string() {
        assert_eq!(class_string("probe", "crash", "KERNEL"), "probe/crash/KERNEL");
    }
}
