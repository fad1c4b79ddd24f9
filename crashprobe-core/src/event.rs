//! Classified occurrences flowing through the dispatcher.

use std::path::PathBuf;

/// How an event was delivered by its upstream producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Raised by a filesystem watch on the trigger location.
    Watched,
    /// Raised by a periodic poll.
    Polled,
}

impl Channel {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Watched => "watched",
            Self::Polled => "polled",
        }
    }
}

/// One classified occurrence, processed to completion by the dispatcher.
///
/// `dir` starts empty and is assigned by the crashlog pipeline when it
/// allocates an archive directory; the telemetry pipeline (which runs after
/// it on the same event) reads collected material from there.
#[derive(Debug, Clone)]
pub enum Event {
    /// A crash definition fired. `path` is the trigger path relative to the
    /// crash's trigger location when the trigger is a directory.
    Crash { name: String, path: Option<String>, channel: Channel, dir: Option<PathBuf> },
    /// An informational event definition fired.
    Info { name: String, dir: Option<PathBuf> },
    /// Periodic uptime tick; each sender decides whether a checkpoint
    /// interval was crossed.
    Uptime,
    /// The agent observed a (re)boot.
    Reboot,
    /// Periodic sweep reconciling guest VM event streams.
    VmSync,
}

impl Event {
    pub fn crash(name: impl Into<String>, path: Option<String>, channel: Channel) -> Self {
        Self::Crash { name: name.into(), path, channel, dir: None }
    }

    pub fn info(name: impl Into<String>) -> Self {
        Self::Info { name: name.into(), dir: None }
    }

    /// Short tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Crash { .. } => "crash",
            Self::Info { .. } => "info",
            Self::Uptime => "uptime",
            Self::Reboot => "reboot",
            Self::VmSync => "vmsync",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        let event = Event::crash("K", None, Channel::Polled);
        assert_eq!(event.kind(), "crash");
        assert_eq!(Event::VmSync.kind(), "vmsync");
        assert_eq!(Channel::Watched.as_str(), "watched");
    }
}
