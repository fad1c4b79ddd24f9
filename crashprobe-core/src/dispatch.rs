//! Event dispatch: routing one event through a sender's pipeline.
//!
//! Routing is purely on the event's type tag. The collection strategy is
//! bound per call (crashlog senders archive locally, telemetry senders
//! forward already-collected material) and is never stored on the shared
//! log configuration, so senders stay independent.

use crate::archive::{ArchiveAllocator, Mode};
use crate::classify;
use crate::collector;
use crate::config::{Config, CrashSpec, SenderConfig, SenderKind, TelemetryConfig, TriggerKind, VmSpec};
use crate::error::{ProbeError, Result};
use crate::event::{Channel, Event};
use crate::fsutil;
use crate::guest::GuestImage;
use crate::history::{self, EventRecorder};
use crate::keys;
use crate::platform::{self, Properties};
use crate::quota::{DirUsageChecker, SpaceChecker};
use crate::telemetry::{
    self, TelemetrySink, TelemetryTransport, CRASH_SEVERITY, INFO_SEVERITY,
};
use crate::uptime::{self, UptimeState};
use crate::vmsync::{self, Outcome, VmLine, LOG_MARKER};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Runtime state of one configured sender. Created once at startup; the
/// config stays immutable while the allocator, uptime checkpoint, and VM
/// cursors are owned mutable state, only ever touched by the processing
/// thread.
pub struct Sender {
    pub config: SenderConfig,
    allocator: ArchiveAllocator,
    uptime_state: UptimeState,
    properties: Properties,
    cursors: vmsync::CursorStore,
}

impl Sender {
    /// Initialize one sender. Output-directory creation and uptime-file
    /// touch failures here are the only conditions fatal to the agent.
    pub fn init(config: SenderConfig, build_version: &str) -> Result<Self> {
        std::fs::create_dir_all(&config.outdir)
            .map_err(|e| ProbeError::io(&config.outdir, e))?;
        let properties = Properties::init(&config.outdir, build_version)?;
        if let Some(up) = &config.uptime {
            // Touch the checkpoint file so upstream watchers can follow it.
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&up.path)
                .map_err(|e| ProbeError::io(&up.path, e))?;
        }
        let allocator = ArchiveAllocator::open(&config.outdir)?;
        let cursors = vmsync::CursorStore::open(config.outdir.join("vm_cursors.json"))?;
        Ok(Self { config, allocator, uptime_state: UptimeState::default(), properties, cursors })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

/// Routes incoming events to the active sender's pipeline.
pub struct Dispatcher {
    config: Arc<Config>,
    recorder: EventRecorder,
    space: Box<dyn SpaceChecker>,
    transport: Option<Box<dyn TelemetryTransport>>,
    guests: HashMap<String, Box<dyn GuestImage>>,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, recorder: EventRecorder) -> Self {
        Self {
            config,
            recorder,
            space: Box::new(DirUsageChecker),
            transport: None,
            guests: HashMap::new(),
        }
    }

    pub fn with_space_checker(mut self, space: Box<dyn SpaceChecker>) -> Self {
        self.space = space;
        self
    }

    pub fn with_transport(mut self, transport: Box<dyn TelemetryTransport>) -> Self {
        self.transport = transport.into();
        self
    }

    /// Register the guest image accessor for one configured VM.
    pub fn register_guest(&mut self, vm_name: impl Into<String>, image: Box<dyn GuestImage>) {
        self.guests.insert(vm_name.into(), image);
    }

    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    /// Process one event to completion for one sender.
    pub fn dispatch(&self, sender: &mut Sender, event: &mut Event) {
        debug!(sender = sender.name(), event = event.kind(), "dispatching");
        match sender.config.kind {
            SenderKind::Crashlog => self.crashlog_send(sender, event),
            SenderKind::Telemetry => self.telemetry_send(sender, event),
        }
    }

    // ---- crashlog pipeline ----

    fn crashlog_send(&self, sender: &mut Sender, event: &mut Event) {
        match event {
            Event::Crash { name, path, channel, dir } => {
                *dir = self.crashlog_crash(sender, name, path.as_deref(), *channel);
            }
            Event::Info { name, dir } => {
                *dir = self.crashlog_info(sender, name);
            }
            Event::Uptime => self.crashlog_uptime(sender),
            Event::Reboot => self.crashlog_reboot(sender),
            Event::VmSync => self.crashlog_vmsync(sender),
        }
    }

    fn crashlog_crash(
        &self,
        sender: &mut Sender,
        name: &str,
        rel_path: Option<&str>,
        channel: Channel,
    ) -> Option<PathBuf> {
        let Some(crash) = self.config.crash_by_name(name) else {
            error!("crash ({}) not found in configuration", name);
            return None;
        };

        let trigger_file = trigger_source(crash, rel_path);
        let classified = match classify::reclassify(crash, trigger_file.as_deref()) {
            Ok(classified) => classified,
            Err(e) => {
                error!("reclassify crash ({}) failed: {}", name, e);
                return None;
            }
        };
        // The key is generated after classification so reclassification is
        // reflected in every record derived from it.
        let key = keys::event_key("CRASH", &classified.spec.name);

        let mut dir = None;
        if !classified.spec.logs.is_empty() || channel == Channel::Watched {
            let allocated = match sender.allocator.allocate(Mode::Crash, &key) {
                Ok(allocated) => allocated,
                Err(e) => {
                    error!("generate crashlog dir failed: {}", e);
                    return None;
                }
            };
            let data = [
                classified.data[0].as_deref(),
                classified.data[1].as_deref(),
                classified.data[2].as_deref(),
            ];
            if let Err(e) =
                history::write_crashfile(&allocated, "CRASH", &key, &classified.spec.name, data)
            {
                warn!("write crashfile failed: {}", e);
            }

            if self.space.available(&sender.config.outdir, sender.config.quota_bytes) {
                for log_name in &classified.spec.logs {
                    match self.config.log_by_name(log_name) {
                        Some(log) => collector::collect(log, &allocated),
                        None => warn!("log ({}) not found in configuration", log_name),
                    }
                }
                if channel == Channel::Watched {
                    self.copy_trigger(crash, rel_path, &allocated);
                }
            } else {
                self.recorder.raise_infoerror("SPACE_FULL");
            }
            dir = Some(allocated);
        }

        if let Err(e) = self.recorder.raise_event_with_key(
            "CRASH",
            &classified.spec.name,
            dir.as_deref(),
            "",
            &key,
        ) {
            error!("failed to record crash event: {}", e);
        }
        dir
    }

    /// Snapshot the trigger file itself into the archive directory.
    fn copy_trigger(&self, crash: &CrashSpec, rel_path: Option<&str>, dir: &Path) {
        let Some(src) = trigger_source(crash, rel_path) else {
            return;
        };
        let Some(name) = src.file_name() else {
            return;
        };
        let dest = dir.join(name);
        if let Err(e) = fsutil::snapshot_copy(&src, &dest) {
            error!("copy ({}) to ({}) failed: {}", src.display(), dest.display(), e);
        }
    }

    fn crashlog_info(&self, sender: &mut Sender, name: &str) -> Option<PathBuf> {
        let Some(info) = self.config.info_by_name(name) else {
            error!("info ({}) not found in configuration", name);
            return None;
        };
        let key = keys::event_key("INFO", name);

        let mut dir = None;
        if !info.logs.is_empty() {
            let allocated = match sender.allocator.allocate(Mode::Stats, &key) {
                Ok(allocated) => allocated,
                Err(e) => {
                    error!("generate stats dir failed: {}", e);
                    return None;
                }
            };
            if self.space.available(&sender.config.outdir, sender.config.quota_bytes) {
                for log_name in &info.logs {
                    match self.config.log_by_name(log_name) {
                        Some(log) => collector::collect(log, &allocated),
                        None => warn!("log ({}) not found in configuration", log_name),
                    }
                }
            } else {
                self.recorder.raise_infoerror("SPACE_FULL");
            }
            dir = Some(allocated);
        }

        if let Err(e) =
            self.recorder.raise_event_with_key("INFO", name, dir.as_deref(), "", &key)
        {
            error!("failed to record info event: {}", e);
        }
        dir
    }

    fn crashlog_uptime(&self, sender: &mut Sender) {
        let Some(up) = &sender.config.uptime else {
            return;
        };
        let (rendered, hours) = match uptime::uptime_string() {
            Ok(value) => value,
            Err(e) => {
                error!("cannot get uptime: {}", e);
                return;
            }
        };
        if sender.uptime_state.advance(hours, up.interval_hours) {
            if let Err(e) = self.recorder.raise_uptime(&rendered) {
                error!("failed to record uptime event: {}", e);
            }
        }
    }

    fn crashlog_reboot(&self, sender: &mut Sender) {
        if sender.properties.swupdated() {
            if let Err(e) = self.recorder.raise_event("INFO", "SWUPDATE", None, "") {
                error!("failed to record software update: {}", e);
            }
        }
        let reason = platform::startup_reason(self.config.startup_reason_file.as_deref());
        if let Err(e) = self.recorder.raise_event("REBOOT", &reason, None, "") {
            error!("failed to record reboot: {}", e);
        }
    }

    fn crashlog_vmsync(&self, sender: &mut Sender) {
        let Sender { config, allocator, cursors, .. } = sender;
        for vm in &self.config.vms {
            let Some(image) = self.guests.get(&vm.name) else {
                warn!("no guest image registered for ({})", vm.name);
                continue;
            };
            let result =
                vmsync::sweep(image.as_ref(), &vm.event_stream, &vm.name, cursors, |line| {
                    self.crashlog_vmevent(config, allocator, vm, image.as_ref(), line)
                });
            if let Err(e) = result {
                warn!("sync of ({}) for ({}) failed: {}", vm.name, config.name, e);
            }
        }
    }

    fn crashlog_vmevent(
        &self,
        config: &SenderConfig,
        allocator: &mut ArchiveAllocator,
        vm: &VmSpec,
        image: &dyn GuestImage,
        line: &VmLine,
    ) -> Outcome {
        // The VM-sync path aborts entirely on quota denial: no history
        // record, no dump, line consumed.
        if !self.space.available(&config.outdir, config.quota_bytes) {
            self.recorder.raise_infoerror("SPACE_FULL");
            return Outcome::Handled;
        }

        let key = keys::event_key("VM", &line.key);

        // Only lines naming a guest log directory get a host directory; a
        // bare event is recorded with no associated directory.
        let mut dir = None;
        if let Some(target) = line.log_target() {
            let allocated = match allocator.allocate(Mode::VmEvent, &key) {
                Ok(allocated) => allocated,
                Err(e) => {
                    error!("generate vmevent dir failed: {}", e);
                    return Outcome::Defer;
                }
            };
            let dpath = target.trim_start_matches('/');
            if let Err(e) = image.dump_dir(dpath, &allocated) {
                let outcome = if e.copied == 0 {
                    warn!("({}) is missing", dpath);
                    Outcome::Handled
                } else {
                    error!("dump ({}) abort at ({})", dpath, e.copied);
                    Outcome::Defer
                };
                // A retry must start clean.
                if let Err(re) = std::fs::remove_dir_all(&allocated) {
                    if re.kind() != std::io::ErrorKind::NotFound {
                        error!("remove ({}) failed: {}", allocated.display(), re);
                    }
                }
                return outcome;
            }
            if let Err(e) = history::write_crashfile(
                &allocated,
                &line.event,
                &key,
                &line.kind,
                [Some(vm.name.as_str()), Some(line.key.as_str()), None],
            ) {
                warn!("write crashfile failed: {}", e);
            }
            dir = Some(allocated);
        }

        if let Err(e) =
            self.recorder.raise_event_with_key(&vm.name, &line.kind, dir.as_deref(), "", &key)
        {
            error!("failed to record vm event: {}", e);
        }
        Outcome::Handled
    }

    // ---- telemetry pipeline ----

    fn telemetry_send(&self, sender: &mut Sender, event: &mut Event) {
        let Some(tcfg) = sender.config.telemetry.clone() else {
            warn!("sender ({}) has no telemetry binding", sender.name());
            return;
        };
        let Some(transport) = &self.transport else {
            warn!("no telemetry transport configured");
            return;
        };
        let sink = TelemetrySink::new(transport.as_ref());
        match event {
            Event::Crash { name, path, channel, dir } => {
                self.telemetry_crash(&sink, &tcfg, name, path.as_deref(), *channel, dir.as_deref());
            }
            Event::Info { name, dir } => self.telemetry_info(&sink, &tcfg, name, dir.as_deref()),
            Event::Uptime => self.telemetry_uptime(&sink, sender, &tcfg),
            Event::Reboot => self.telemetry_reboot(&sink, sender, &tcfg),
            Event::VmSync => self.telemetry_vmsync(&sink, sender),
        }
    }

    fn telemetry_crash(
        &self,
        sink: &TelemetrySink<'_>,
        tcfg: &TelemetryConfig,
        name: &str,
        rel_path: Option<&str>,
        channel: Channel,
        dir: Option<&Path>,
    ) {
        let Some(crash) = self.config.crash_by_name(name) else {
            error!("crash ({}) not found in configuration", name);
            return;
        };
        // Classification is deterministic over the same trigger content, so
        // this yields the same class the crashlog pipeline recorded.
        let trigger_file = trigger_source(crash, rel_path);
        let classified = match classify::reclassify(crash, trigger_file.as_deref()) {
            Ok(classified) => classified,
            Err(e) => {
                error!("reclassify crash ({}) failed: {}", name, e);
                return;
            }
        };

        let class = telemetry::class_string(&tcfg.namespace, "crash", &classified.spec.name);
        let eventid = keys::class_digest(&class);

        for log_name in &classified.spec.logs {
            sink.forward_log(dir, log_name, Some(&eventid), CRASH_SEVERITY, &class);
        }

        if channel == Channel::Watched {
            self.forward_trigger(sink, crash, rel_path, dir, &eventid, &class);
        }
    }

    /// Forward the trigger file itself, falling back to the original path
    /// when the archived copy is missing.
    fn forward_trigger(
        &self,
        sink: &TelemetrySink<'_>,
        crash: &CrashSpec,
        rel_path: Option<&str>,
        dir: Option<&Path>,
        eventid: &str,
        class: &str,
    ) {
        let Some(src) = trigger_source(crash, rel_path) else {
            return;
        };
        let Some(name) = src.file_name() else {
            return;
        };
        let archived = dir.map(|d| d.join(name));
        match archived {
            Some(path) if path.exists() => {
                let _ = sink.send_data(
                    &path.display().to_string(),
                    Some(eventid),
                    CRASH_SEVERITY,
                    class,
                );
            }
            _ => {
                if src.exists() {
                    warn!("archived trigger unavailable, trying the original path ({})",
                          src.display());
                    let _ = sink.send_data(
                        &src.display().to_string(),
                        Some(eventid),
                        CRASH_SEVERITY,
                        class,
                    );
                } else {
                    error!("original path ({}) is unavailable", src.display());
                }
            }
        }
    }

    fn telemetry_info(
        &self,
        sink: &TelemetrySink<'_>,
        tcfg: &TelemetryConfig,
        name: &str,
        dir: Option<&Path>,
    ) {
        let Some(info) = self.config.info_by_name(name) else {
            error!("info ({}) not found in configuration", name);
            return;
        };
        let class = telemetry::class_string(&tcfg.namespace, "info", &info.name);
        let eventid = keys::class_digest(&class);
        for log_name in &info.logs {
            sink.forward_log(dir, log_name, Some(&eventid), INFO_SEVERITY, &class);
        }
    }

    fn telemetry_uptime(
        &self,
        sink: &TelemetrySink<'_>,
        sender: &mut Sender,
        tcfg: &TelemetryConfig,
    ) {
        let Some(up) = &sender.config.uptime else {
            return;
        };
        let (rendered, hours) = match uptime::uptime_string() {
            Ok(value) => value,
            Err(e) => {
                error!("cannot get uptime: {}", e);
                return;
            }
        };
        if sender.uptime_state.advance(hours, up.interval_hours) {
            let class = telemetry::class_string(&tcfg.namespace, "uptime", &rendered);
            let _ = sink.send_data(
                &format!("system boot time: {rendered}"),
                None,
                INFO_SEVERITY,
                &class,
            );
        }
    }

    fn telemetry_reboot(
        &self,
        sink: &TelemetrySink<'_>,
        sender: &mut Sender,
        tcfg: &TelemetryConfig,
    ) {
        if sender.properties.swupdated() {
            let class = telemetry::class_string(&tcfg.namespace, "swupdate", "-");
            let _ = sink.send_data(
                &format!("system update to: {}", self.config.build_version),
                None,
                INFO_SEVERITY,
                &class,
            );
        }
        let reason = platform::startup_reason(self.config.startup_reason_file.as_deref());
        let class = telemetry::class_string(&tcfg.namespace, "reboot", &reason);
        let _ = sink.send_data("reboot", None, INFO_SEVERITY, &class);
    }

    fn telemetry_vmsync(&self, sink: &TelemetrySink<'_>, sender: &mut Sender) {
        let Sender { config, cursors, .. } = sender;
        for vm in &self.config.vms {
            let Some(image) = self.guests.get(&vm.name) else {
                warn!("no guest image registered for ({})", vm.name);
                continue;
            };
            let result =
                vmsync::sweep(image.as_ref(), &vm.event_stream, &vm.name, cursors, |line| {
                    self.telemetry_vmevent(sink, vm, line)
                });
            if let Err(e) = result {
                warn!("sync of ({}) for ({}) failed: {}", vm.name, config.name, e);
            }
        }
    }

    fn telemetry_vmevent(&self, sink: &TelemetrySink<'_>, vm: &VmSpec, line: &VmLine) -> Outcome {
        let severity = if line.event == "CRASH" { CRASH_SEVERITY } else { INFO_SEVERITY };

        // Logs are assumed already mirrored by the crashlog sender; locate
        // the materialized host directory rather than touching the guest.
        let mut vmlogpath = None;
        if let Some(target) = line.log_target() {
            let Some(crashlog) = self.config.sender_by_kind(SenderKind::Crashlog) else {
                return Outcome::Handled;
            };
            let needle = &target[LOG_MARKER.len()..];
            vmlogpath = fsutil::find_dir_substr(&crashlog.outdir, needle, 2);
        }

        let class = format!("{}/{}/{}", vm.name, line.event, line.kind);
        let eventid = keys::class_digest(&class);

        let Some(logdir) = vmlogpath else {
            return match sink.send_data("no logs", Some(&eventid), severity, &class) {
                Ok(()) => Outcome::Handled,
                Err(_) => Outcome::Defer,
            };
        };

        let files = match fsutil::list_files(&logdir) {
            Ok(files) => files,
            Err(e) => {
                error!("lsdir ({}) failed: {}", logdir.display(), e);
                return Outcome::Defer;
            }
        };
        if files.is_empty() {
            let msg = format!("no logs under ({})", logdir.display());
            return match sink.send_data(&msg, Some(&eventid), severity, &class) {
                Ok(()) => Outcome::Handled,
                Err(_) => Outcome::Defer,
            };
        }

        let mut outcome = Outcome::Handled;
        for file in files {
            if sink
                .send_data(&file.display().to_string(), Some(&eventid), severity, &class)
                .is_err()
            {
                outcome = Outcome::Defer;
            }
        }
        outcome
    }
}

/// Resolve the concrete trigger file for a crash event, if any: directory
/// triggers join the event's relative path, file triggers are the watched
/// file itself.
fn trigger_source(crash: &CrashSpec, rel_path: Option<&str>) -> Option<PathBuf> {
    match &crash.trigger {
        Some(trigger) if trigger.kind == TriggerKind::Dir => {
            rel_path.map(|rel| trigger.path.join(rel))
        }
        Some(trigger) if trigger.kind == TriggerKind::File => Some(trigger.path.clone()),
        _ => None,
    }
}
