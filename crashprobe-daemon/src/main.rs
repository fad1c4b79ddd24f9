//! crashprobe agent daemon.
//!
//! Producers (trigger polling, uptime ticks, VM-sync sweeps) feed one
//! channel; a single consumer processes each event to completion across all
//! senders, so no two events are ever handled concurrently.

use anyhow::Context;
use crashprobe_core::config::SenderKind;
use crashprobe_core::guest::DirImage;
use crashprobe_core::{Config, Dispatcher, Event, EventRecorder, HttpTransport, Sender};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod triggers;

const TRIGGER_POLL: Duration = Duration::from_secs(5);
const UPTIME_TICK: Duration = Duration::from_secs(300);
const VMSYNC_TICK: Duration = Duration::from_secs(60);

const HISTORY_FILE: &str = "history_event";

fn config_path() -> PathBuf {
    std::env::var("CRASHPROBE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/crashprobe/config.json"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .init();

    info!("crashprobe daemon starting");

    let path = config_path();
    let config = Arc::new(Config::load(&path).with_context(|| {
        format!("loading configuration from {}", path.display())
    })?);

    // Sender initialization failures (output directory, uptime file) are the
    // only startup conditions fatal to the agent.
    let mut senders = Vec::new();
    for sender_cfg in &config.senders {
        let sender = Sender::init(sender_cfg.clone(), &config.build_version)
            .with_context(|| format!("initializing sender {}", sender_cfg.name))?;
        info!(sender = sender.name(), outdir = %sender.config.outdir.display(), "sender ready");
        senders.push(sender);
    }
    // The crashlog sender archives first so the telemetry sender can forward
    // the collected material of the same event.
    senders.sort_by_key(|sender| match sender.config.kind {
        SenderKind::Crashlog => 0,
        SenderKind::Telemetry => 1,
    });

    let crashlog = config
        .sender_by_kind(SenderKind::Crashlog)
        .context("no crashlog sender configured")?;
    let recorder = EventRecorder::new(crashlog.outdir.join(HISTORY_FILE));
    recorder.prepare().context("preparing history file")?;

    let mut dispatcher = Dispatcher::new(config.clone(), recorder);
    if let Some(telemetry) = config.sender_by_kind(SenderKind::Telemetry) {
        if let Some(binding) = &telemetry.telemetry {
            dispatcher = dispatcher.with_transport(Box::new(HttpTransport::new(&binding.endpoint)));
        }
    }
    for vm in &config.vms {
        dispatcher.register_guest(vm.name.clone(), Box::new(DirImage::new(&vm.image)));
    }

    let (tx, rx) = mpsc::channel::<Event>();

    // Single run-to-completion consumer; blocking I/O stays off the runtime.
    let consumer = tokio::task::spawn_blocking(move || {
        while let Ok(mut event) = rx.recv() {
            for sender in senders.iter_mut() {
                dispatcher.dispatch(sender, &mut event);
            }
        }
        info!("event stream closed, consumer exiting");
    });

    // The boot itself is the first event.
    tx.send(Event::Reboot).ok();

    let mut scanner = triggers::TriggerScanner::new(config.clone());
    let trigger_tx = tx.clone();
    let trigger_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(TRIGGER_POLL);
        loop {
            tick.tick().await;
            for event in scanner.scan() {
                if trigger_tx.send(event).is_err() {
                    return;
                }
            }
        }
    });

    let uptime_tx = tx.clone();
    let uptime_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(UPTIME_TICK);
        tick.tick().await; // immediate first tick is not a checkpoint
        loop {
            tick.tick().await;
            if uptime_tx.send(Event::Uptime).is_err() {
                return;
            }
        }
    });

    let vmsync_tx = tx.clone();
    let vmsync_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(VMSYNC_TICK);
        loop {
            tick.tick().await;
            if vmsync_tx.send(Event::VmSync).is_err() {
                return;
            }
        }
    });

    info!("crashprobe daemon ready");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("received shutdown signal");

    trigger_task.abort();
    uptime_task.abort();
    vmsync_task.abort();
    let _ = trigger_task.await;
    let _ = uptime_task.await;
    let _ = vmsync_task.await;

    // Dropping the last producer handle closes the stream; the consumer
    // finishes the event in flight and exits.
    drop(tx);
    if let Err(e) = consumer.await {
        if e.is_panic() {
            error!("consumer task panicked: {}", e);
        } else {
            warn!("consumer task cancelled: {}", e);
        }
    }

    info!("crashprobe daemon shutting down");
    Ok(())
}
