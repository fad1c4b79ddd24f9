//! crashprobe core library
//!
//! Event-collection core of the crashprobe host agent: log collection
//! strategies, quota-gated archiving, the append-only event history, crash
//! reclassification, guest VM event synchronization, and optional telemetry
//! forwarding.

pub mod archive;
pub mod classify;
pub mod collector;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod fsutil;
pub mod guest;
pub mod history;
pub mod keys;
pub mod platform;
pub mod quota;
pub mod telemetry;
pub mod uptime;
pub mod vmsync;

// Re-export commonly used items
pub use config::{Config, LogKind, LogSpec, SenderConfig, SenderKind};
pub use dispatch::{Dispatcher, Sender};
pub use error::{ProbeError, Result};
pub use event::{Channel, Event};
pub use history::EventRecorder;
pub use telemetry::{HttpTransport, TelemetryTransport};
pub use vmsync::Outcome;
