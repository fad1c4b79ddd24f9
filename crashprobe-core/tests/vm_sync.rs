//! Integration tests for guest VM event synchronization.

use crashprobe_core::config::{
    Config, SenderConfig, SenderKind, TelemetryConfig, VmSpec,
};
use crashprobe_core::dispatch::{Dispatcher, Sender};
use crashprobe_core::event::Event;
use crashprobe_core::guest::{DirImage, DumpError, DumpReport, GuestImage};
use crashprobe_core::history::EventRecorder;
use crashprobe_core::quota::SpaceChecker;
use crashprobe_core::telemetry::{TelemetryRecord, TelemetryTransport};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const VM_KEY: &str = "aaaabbbbccccddddeeee";

struct DenyAll;

impl SpaceChecker for DenyAll {
    fn available(&self, _outdir: &Path, _quota_bytes: u64) -> bool {
        false
    }
}

#[derive(Clone, Default)]
struct RecordingTransport {
    sent: Arc<Mutex<Vec<TelemetryRecord>>>,
}

impl TelemetryTransport for RecordingTransport {
    fn send(&self, record: &TelemetryRecord) -> crashprobe_core::Result<()> {
        self.sent.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Guest image whose next dump aborts partway, leaving partial progress.
struct FlakyImage {
    inner: DirImage,
    fail_next: Arc<AtomicBool>,
}

impl GuestImage for FlakyImage {
    fn read_file(&self, dpath: &str) -> crashprobe_core::Result<String> {
        self.inner.read_file(dpath)
    }

    fn dump_dir(&self, dpath: &str, dest: &Path) -> Result<DumpReport, DumpError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            // Materialize part of the dump before aborting.
            let partial = dest.join("partial");
            std::fs::create_dir_all(&partial).unwrap();
            std::fs::write(partial.join("halfwritten.log"), "partial").unwrap();
            return Err(DumpError {
                copied: 2,
                source: crashprobe_core::ProbeError::Internal("simulated abort".into()),
            });
        }
        self.inner.dump_dir(dpath, dest)
    }
}

struct Fixture {
    _work: TempDir,
    guest_root: PathBuf,
    outdir: PathBuf,
    config: Config,
}

fn fixture() -> Fixture {
    let work = TempDir::new().unwrap();
    let guest_root = work.path().join("guest");
    let outdir = work.path().join("out");
    std::fs::create_dir_all(guest_root.join("logs")).unwrap();

    let config = Config {
        build_version: "1.0".into(),
        startup_reason_file: None,
        logs: vec![],
        crashes: vec![],
        infos: vec![],
        vms: vec![VmSpec {
            name: "vm0".into(),
            image: guest_root.clone(),
            event_stream: "logs/history_event".into(),
        }],
        senders: vec![SenderConfig {
            name: "crashlog".into(),
            kind: SenderKind::Crashlog,
            outdir: outdir.clone(),
            quota_bytes: 10 * 1024 * 1024,
            uptime: None,
            telemetry: None,
        }],
    };

    Fixture { _work: work, guest_root, outdir, config }
}

fn write_stream(fixture: &Fixture, lines: &[&str]) {
    std::fs::write(
        fixture.guest_root.join("logs/history_event"),
        lines.join("\n") + "\n",
    )
    .unwrap();
}

fn write_guest_logs(fixture: &Fixture, dirname: &str, files: &[(&str, &str)]) {
    let dir = fixture.guest_root.join("logs").join(dirname);
    std::fs::create_dir_all(&dir).unwrap();
    for (name, content) in files {
        std::fs::write(dir.join(name), content).unwrap();
    }
}

fn crash_line() -> String {
    format!("CRASH {VM_KEY} 2017-11-11/03:12:59 JAVACRASH /data/logs/crashlog0_{VM_KEY}")
}

fn vmevent_dirs(outdir: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(outdir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir() && path.file_name().unwrap().to_string_lossy().starts_with("vmevent")
        })
        .collect();
    dirs.sort();
    dirs
}

fn history_lines(recorder: &EventRecorder) -> Vec<String> {
    std::fs::read_to_string(recorder.path())
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}

fn cursor_of(outdir: &Path, vm: &str) -> Option<String> {
    let content = std::fs::read_to_string(outdir.join("vm_cursors.json")).ok()?;
    let cursors: HashMap<String, String> = serde_json::from_str(&content).ok()?;
    cursors.get(vm).cloned()
}

fn setup(fixture: &Fixture, image: Box<dyn GuestImage>) -> (Dispatcher, Sender) {
    let recorder = EventRecorder::new(fixture.outdir.join("history_event"));
    let sender = Sender::init(fixture.config.senders[0].clone(), "1.0").unwrap();
    recorder.prepare().unwrap();
    let mut dispatcher = Dispatcher::new(Arc::new(fixture.config.clone()), recorder);
    dispatcher.register_guest("vm0", image);
    (dispatcher, sender)
}

#[test]
fn crash_line_dumps_guest_logs_and_records() {
    let fixture = fixture();
    write_stream(&fixture, &[&crash_line()]);
    write_guest_logs(
        &fixture,
        &format!("crashlog0_{VM_KEY}"),
        &[("main.log", "m"), ("events.log", "e")],
    );
    let (dispatcher, mut sender) = setup(&fixture, Box::new(DirImage::new(&fixture.guest_root)));

    dispatcher.dispatch(&mut sender, &mut Event::VmSync);

    let dirs = vmevent_dirs(&fixture.outdir);
    assert_eq!(dirs.len(), 1);
    let dumped = dirs[0].join(format!("crashlog0_{VM_KEY}"));
    assert_eq!(std::fs::read_to_string(dumped.join("main.log")).unwrap(), "m");
    assert_eq!(std::fs::read_to_string(dumped.join("events.log")).unwrap(), "e");

    let crashfile = std::fs::read_to_string(dirs[0].join("crashfile")).unwrap();
    assert!(crashfile.contains("EVENT=CRASH"));
    assert!(crashfile.contains("TYPE=JAVACRASH"));
    assert!(crashfile.contains("DATA0=vm0"));
    assert!(crashfile.contains(&format!("DATA1={VM_KEY}")));

    let lines = history_lines(dispatcher.recorder());
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("vm0"));
    assert!(lines[0].contains("JAVACRASH"));

    assert_eq!(cursor_of(&fixture.outdir, "vm0").as_deref(), Some(VM_KEY));

    // A second sweep past the advanced cursor is a no-op.
    dispatcher.dispatch(&mut sender, &mut Event::VmSync);
    assert_eq!(vmevent_dirs(&fixture.outdir).len(), 1);
    assert_eq!(history_lines(dispatcher.recorder()).len(), 1);
}

#[test]
fn missing_guest_dir_is_consumed_without_leftovers() {
    let fixture = fixture();
    write_stream(&fixture, &[&crash_line()]);
    // No crashlog0_* directory exists in the guest image.
    let (dispatcher, mut sender) = setup(&fixture, Box::new(DirImage::new(&fixture.guest_root)));

    dispatcher.dispatch(&mut sender, &mut Event::VmSync);

    assert!(vmevent_dirs(&fixture.outdir).is_empty());
    assert!(history_lines(dispatcher.recorder()).is_empty());
    // Consumed: the line will not be retried.
    assert_eq!(cursor_of(&fixture.outdir, "vm0").as_deref(), Some(VM_KEY));
}

#[test]
fn deferred_dump_retries_to_identical_contents() {
    let fixture = fixture();
    write_stream(&fixture, &[&crash_line()]);
    write_guest_logs(
        &fixture,
        &format!("crashlog0_{VM_KEY}"),
        &[("main.log", "m"), ("events.log", "e")],
    );
    let fail_next = Arc::new(AtomicBool::new(true));
    let image = FlakyImage {
        inner: DirImage::new(&fixture.guest_root),
        fail_next: fail_next.clone(),
    };
    let (dispatcher, mut sender) = setup(&fixture, Box::new(image));

    // First sweep defers: partial host directory is cleaned up and the
    // cursor stays put.
    dispatcher.dispatch(&mut sender, &mut Event::VmSync);
    assert!(vmevent_dirs(&fixture.outdir).is_empty());
    assert_eq!(cursor_of(&fixture.outdir, "vm0"), None);
    assert!(history_lines(dispatcher.recorder()).is_empty());

    // Retry succeeds and the final contents match a single-pass dump.
    dispatcher.dispatch(&mut sender, &mut Event::VmSync);
    let dirs = vmevent_dirs(&fixture.outdir);
    assert_eq!(dirs.len(), 1);
    let dumped = dirs[0].join(format!("crashlog0_{VM_KEY}"));
    let mut names: Vec<String> = std::fs::read_dir(&dumped)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["events.log", "main.log"]);
    assert!(!dumped.join("partial").exists());
    assert_eq!(history_lines(dispatcher.recorder()).len(), 1);
    assert_eq!(cursor_of(&fixture.outdir, "vm0").as_deref(), Some(VM_KEY));
}

#[test]
fn quota_denial_aborts_line_entirely() {
    let fixture = fixture();
    write_stream(&fixture, &[&crash_line()]);
    write_guest_logs(&fixture, &format!("crashlog0_{VM_KEY}"), &[("main.log", "m")]);

    let recorder = EventRecorder::new(fixture.outdir.join("history_event"));
    let mut sender = Sender::init(fixture.config.senders[0].clone(), "1.0").unwrap();
    recorder.prepare().unwrap();
    let mut dispatcher = Dispatcher::new(Arc::new(fixture.config.clone()), recorder)
        .with_space_checker(Box::new(DenyAll));
    dispatcher.register_guest("vm0", Box::new(DirImage::new(&fixture.guest_root)));

    dispatcher.dispatch(&mut sender, &mut Event::VmSync);

    // Unlike the crash pipeline, denial here suppresses the whole line:
    // no dump, no VM history record, line consumed.
    assert!(vmevent_dirs(&fixture.outdir).is_empty());
    let lines = history_lines(dispatcher.recorder());
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("SPACE_FULL"));
    assert_eq!(cursor_of(&fixture.outdir, "vm0").as_deref(), Some(VM_KEY));
}

#[test]
fn line_without_log_reference_records_bare_event() {
    let fixture = fixture();
    write_stream(&fixture, &["REBOOT bbbbccccddddeeeeffff 2011-11-11/11:20:51 POWER-ON 0000:00:00"]);
    let (dispatcher, mut sender) = setup(&fixture, Box::new(DirImage::new(&fixture.guest_root)));

    dispatcher.dispatch(&mut sender, &mut Event::VmSync);

    // No guest log directory named, so no host directory is allocated.
    assert!(vmevent_dirs(&fixture.outdir).is_empty());
    let lines = history_lines(dispatcher.recorder());
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("vm0"));
    assert!(lines[0].contains("POWER-ON"));
    assert_eq!(cursor_of(&fixture.outdir, "vm0").as_deref(), Some("bbbbccccddddeeeeffff"));
}

#[test]
fn malformed_lines_never_block_the_stream() {
    let fixture = fixture();
    write_stream(&fixture, &["not a valid line", &crash_line()]);
    write_guest_logs(&fixture, &format!("crashlog0_{VM_KEY}"), &[("main.log", "m")]);
    let (dispatcher, mut sender) = setup(&fixture, Box::new(DirImage::new(&fixture.guest_root)));

    dispatcher.dispatch(&mut sender, &mut Event::VmSync);

    // The garbage line is skipped; the well-formed line behind it lands.
    assert_eq!(vmevent_dirs(&fixture.outdir).len(), 1);
    assert_eq!(history_lines(dispatcher.recorder()).len(), 1);
    assert_eq!(cursor_of(&fixture.outdir, "vm0").as_deref(), Some(VM_KEY));
}

#[test]
fn telemetry_sweep_forwards_materialized_logs() {
    let mut fixture = fixture();
    write_stream(&fixture, &[&crash_line()]);
    write_guest_logs(
        &fixture,
        &format!("crashlog0_{VM_KEY}"),
        &[("main.log", "m"), ("events.log", "e")],
    );

    let telemetry_out = fixture.outdir.parent().unwrap().join("telemetry-out");
    let telemetry_cfg = SenderConfig {
        name: "telemetry".into(),
        kind: SenderKind::Telemetry,
        outdir: telemetry_out,
        quota_bytes: 10 * 1024 * 1024,
        uptime: None,
        telemetry: Some(TelemetryConfig {
            namespace: "probe".into(),
            endpoint: "http://localhost:9000/collect".into(),
        }),
    };
    fixture.config.senders.push(telemetry_cfg.clone());

    let transport = RecordingTransport::default();
    let recorder = EventRecorder::new(fixture.outdir.join("history_event"));
    recorder.prepare().unwrap();
    let mut crashlog = Sender::init(fixture.config.senders[0].clone(), "1.0").unwrap();
    let mut telemetry = Sender::init(telemetry_cfg, "1.0").unwrap();
    let mut dispatcher = Dispatcher::new(Arc::new(fixture.config.clone()), recorder)
        .with_transport(Box::new(transport.clone()));
    dispatcher.register_guest("vm0", Box::new(DirImage::new(&fixture.guest_root)));

    // The crashlog sweep materializes the guest logs on the host; the
    // telemetry sweep then forwards them without touching the guest.
    dispatcher.dispatch(&mut crashlog, &mut Event::VmSync);
    dispatcher.dispatch(&mut telemetry, &mut Event::VmSync);

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    for record in sent.iter() {
        assert_eq!(record.class, "vm0/CRASH/JAVACRASH");
        assert_eq!(record.severity, 4);
        assert_eq!(record.event_id.as_ref().unwrap().len(), 32);
    }
    let payloads: Vec<_> = sent.iter().map(|record| record.payload.clone()).collect();
    assert!(payloads.iter().any(|payload| payload.contains("main.log")));
    assert!(payloads.iter().any(|payload| payload.contains("events.log")));
}

#[test]
fn telemetry_sweep_without_materialized_logs_sends_fallback() {
    let mut fixture = fixture();
    write_stream(&fixture, &[&crash_line()]);

    let telemetry_out = fixture.outdir.parent().unwrap().join("telemetry-out");
    let telemetry_cfg = SenderConfig {
        name: "telemetry".into(),
        kind: SenderKind::Telemetry,
        outdir: telemetry_out,
        quota_bytes: 10 * 1024 * 1024,
        uptime: None,
        telemetry: Some(TelemetryConfig {
            namespace: "probe".into(),
            endpoint: "http://localhost:9000/collect".into(),
        }),
    };
    fixture.config.senders.push(telemetry_cfg.clone());

    let transport = RecordingTransport::default();
    let recorder = EventRecorder::new(fixture.outdir.join("history_event"));
    recorder.prepare().unwrap();
    std::fs::create_dir_all(&fixture.outdir).unwrap();
    let mut telemetry = Sender::init(telemetry_cfg, "1.0").unwrap();
    let mut dispatcher = Dispatcher::new(Arc::new(fixture.config.clone()), recorder)
        .with_transport(Box::new(transport.clone()));
    dispatcher.register_guest("vm0", Box::new(DirImage::new(&fixture.guest_root)));

    dispatcher.dispatch(&mut telemetry, &mut Event::VmSync);

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload, "no logs");
}
