//! nook-trmnl daemon.
//!
//! Runs as root on the e-reader. It wakes the device on the RTC alarm or on
//! headset insertion, fetches the current TRMNL image, hands it to the
//! viewer, then puts the device back to sleep until the next refresh.
//!
//! # Environment
//!
//! | Variable | Default |
//! |----------|---------|
//! | `NOOK_TRMNL_CONFIG` | `/data/local/nook-trmnl/config.json` |
//! | `NOOK_TRMNL_ACTIVITY_LOG` | `/data/local/nook-trmnl/update_activity.log` |
//! | `NOOK_TRMNL_OUTPUT` | `/data/local/nook-trmnl/display` |
//! | `RUST_LOG` | `info` |
//!
//! # Build
//!
//! ```bash
//! cargo build --release --features android,http --target armv7-linux-androideabi
//! ```

use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use tokio::sync::mpsc;

use nook_trmnl::activity::{ActivityLog, DEFAULT_LIMIT_BYTES};
use nook_trmnl::config::{ConfigStore, JsonFileStore};
use nook_trmnl::cycle::{CycleOutcome, UpdateCycleCoordinator};
use nook_trmnl::hal::{
    AndroidPower, FileDisplay, HeadsetMonitor, ReqwestClient, RtcAlarm, SysfsBattery,
};
use nook_trmnl::power::PowerController;
use nook_trmnl::scheduler::{CycleExecutor, Scheduler};
use nook_trmnl::service::UpdateService;
use nook_trmnl::surface::FetchingSurface;
use nook_trmnl::traits::{Clock, SystemClock};

const DEFAULT_CONFIG: &str = "/data/local/nook-trmnl/config.json";
const DEFAULT_ACTIVITY_LOG: &str = "/data/local/nook-trmnl/update_activity.log";
const DEFAULT_OUTPUT: &str = "/data/local/nook-trmnl/display";

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // =========================================================================
    // Configuration
    // =========================================================================
    let config_path = env_or("NOOK_TRMNL_CONFIG", DEFAULT_CONFIG);
    let store: Arc<dyn ConfigStore> = Arc::new(JsonFileStore::new(&config_path));
    let settings = store
        .load()
        .with_context(|| format!("loading {config_path}"))?;
    info!(
        "nook-trmnl starting: server {}, device {}",
        settings.config.server.base_url, settings.config.device.id
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (triggers_tx, triggers_rx) = mpsc::unbounded_channel();

    // =========================================================================
    // Components
    // =========================================================================
    let scheduler = Arc::new(Scheduler::new(
        RtcAlarm::default(),
        Arc::clone(&clock),
        Arc::clone(&store),
        settings.config.scheduler.clone(),
        triggers_tx,
    ));

    let http = ReqwestClient::new().context("building HTTP client")?;
    let surface = FetchingSurface::new(
        http,
        FileDisplay::new(env_or("NOOK_TRMNL_OUTPUT", DEFAULT_OUTPUT)),
        SysfsBattery::default(),
        Arc::clone(&store),
        Arc::clone(&clock),
    );

    let power = PowerController::new(AndroidPower::default(), settings.config.power.clone());
    let journal = ActivityLog::open(
        env_or("NOOK_TRMNL_ACTIVITY_LOG", DEFAULT_ACTIVITY_LOG),
        DEFAULT_LIMIT_BYTES,
    );
    let coordinator = Arc::new(
        UpdateCycleCoordinator::new(
            power,
            surface,
            Arc::clone(&scheduler),
            Arc::clone(&store),
            Arc::clone(&clock),
        )
        .with_journal(journal),
    );

    let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
    let executor = CycleExecutor::new(coordinator).with_reports(reports_tx);
    tokio::spawn(async move {
        while let Some(report) = reports_rx.recv().await {
            match report.outcome {
                CycleOutcome::Completed { next_wake_at_ms, .. } => info!(
                    "cycle {} done, next wake at {next_wake_at_ms}",
                    report.cycle.id
                ),
                CycleOutcome::Retry { next_wake_at_ms, reason } => warn!(
                    "cycle {} will retry at {next_wake_at_ms}: {reason}",
                    report.cycle.id
                ),
            }
        }
    });

    // =========================================================================
    // Triggers
    // =========================================================================
    tokio::spawn(HeadsetMonitor::default().run(Arc::clone(&scheduler)));

    let service = UpdateService::new(executor, scheduler, store, clock);
    service.run(triggers_rx).await;
    Ok(())
}
