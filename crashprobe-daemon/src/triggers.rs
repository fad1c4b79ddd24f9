//! Poll-based event producers.
//!
//! The agent core does not decide when an event occurs; these scanners do
//! the minimal upstream job: watch crash trigger locations for new entries
//! and report them as events. The first scan only records a baseline so
//! triggers already archived by a previous run are not re-collected.

use crashprobe_core::config::{Config, TriggerKind};
use crashprobe_core::event::{Channel, Event};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

pub struct TriggerScanner {
    config: Arc<Config>,
    /// Entries already seen per directory-kind trigger.
    seen: HashMap<String, HashSet<String>>,
    /// Last observed mtime per file-kind trigger.
    mtimes: HashMap<String, SystemTime>,
    primed: bool,
}

impl TriggerScanner {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config, seen: HashMap::new(), mtimes: HashMap::new(), primed: false }
    }

    /// Scan all configured crash triggers, returning the events to raise.
    pub fn scan(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        let priming = !self.primed;
        self.primed = true;

        for crash in &self.config.crashes {
            let Some(trigger) = &crash.trigger else {
                continue;
            };
            match trigger.kind {
                TriggerKind::Dir => {
                    let seen = self.seen.entry(crash.name.clone()).or_default();
                    let Ok(entries) = std::fs::read_dir(&trigger.path) else {
                        continue;
                    };
                    for entry in entries.filter_map(|entry| entry.ok()) {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        if seen.insert(name.clone()) && !priming {
                            debug!("trigger ({}) appeared for ({})", name, crash.name);
                            events.push(Event::crash(
                                crash.name.clone(),
                                Some(name),
                                Channel::Watched,
                            ));
                        }
                    }
                }
                TriggerKind::File => {
                    let Ok(meta) = std::fs::metadata(&trigger.path) else {
                        continue;
                    };
                    let Ok(mtime) = meta.modified() else {
                        continue;
                    };
                    let previous = self.mtimes.insert(crash.name.clone(), mtime);
                    if !priming && previous.map(|prev| prev < mtime).unwrap_or(true) {
                        debug!("trigger file changed for ({})", crash.name);
                        let name = trigger
                            .path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned());
                        events.push(Event::crash(crash.name.clone(), name, Channel::Polled));
                    }
                }
            }
        }
        events
    }
}
