//! # nook-trmnl
//!
//! Turns a rooted e-reader into a dedicated TRMNL display: wake the device,
//! bring up the network, fetch the rendered image and refresh interval, show
//! it, and put the device back to sleep until the next wake.
//!
//! ## Features
//!
//! - **Power coordination**: Radio, power-enhance toggle and a time-bounded wake hold
//! - **Bounded waits**: Every connectivity poll, fetch and completion signal has a timeout
//! - **Graceful degradation**: Failures end in sleep plus a rescheduled retry, never a stuck radio
//! - **Single pending wake**: Scheduling replaces, triggers coalesce into the running cycle
//!
//! ## Architecture
//!
//! The crate is structured to allow testing on desktop without a device:
//!
//! - `traits` - Platform, network and display abstractions
//! - `power` - Wake/sleep primitives with per-step fault isolation
//! - `fetch` - Registration, display payload and image requests
//! - `signals` - Per-cycle completion channel between surface and coordinator
//! - `cycle` - The update cycle state machine
//! - `scheduler` - Durable single wake, trigger sources, single-cycle executor
//! - `service` - Trigger policy and restart handling
//! - `surface` - Rendering surface doing fetch and paint
//! - `hal` - Concrete implementations (mock for testing, android for the device)
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use nook_trmnl::{
//!     Config, MemoryStore, PowerController, Scheduler, TriggerSource, UpdateCycleCoordinator,
//!     hal::{MockAlarm, MockClock, MockPower, MockSurface, SurfaceScript},
//!     traits::Clock,
//! };
//!
//! let rt = tokio::runtime::Builder::new_current_thread()
//!     .enable_time()
//!     .start_paused(true)
//!     .build()
//!     .unwrap();
//!
//! rt.block_on(async {
//!     let clock: Arc<dyn Clock> = Arc::new(MockClock::default());
//!     let store = Arc::new(MemoryStore::with_config(Config::default()));
//!     let (tx, _rx) = mpsc::unbounded_channel();
//!     let scheduler = Arc::new(Scheduler::new(
//!         MockAlarm::new(),
//!         clock.clone(),
//!         store.clone(),
//!         Default::default(),
//!         tx,
//!     ));
//!
//!     // Surface reports a 300s refresh after 2s, paints 1s later
//!     let surface = MockSurface::new(SurfaceScript::completes(
//!         Duration::from_secs(2),
//!         300,
//!         Duration::from_secs(1),
//!     ));
//!     let power = PowerController::new(MockPower::connected(), Default::default());
//!     let coordinator = UpdateCycleCoordinator::new(power, surface, scheduler, store, clock);
//!
//!     let report = coordinator.run_cycle(TriggerSource::Manual).await;
//!     assert!(report.is_success());
//!     assert_eq!(report.cycle.effective_refresh_secs, 300);
//! });
//! ```

#![warn(missing_docs)]

/// Size-bounded on-disk activity journal.
pub mod activity;
/// Configuration, persisted device state and stores.
pub mod config;
/// The update cycle state machine.
pub mod cycle;
/// Error types for every concern.
pub mod error;
/// Display server requests and retry policy.
pub mod fetch;
/// Hardware abstraction layer with mock implementations for testing.
pub mod hal;
/// Device wake/sleep and connectivity.
pub mod power;
/// Wake scheduling, trigger sources and the single-cycle executor.
pub mod scheduler;
/// Trigger handling for the daemon.
pub mod service;
/// Per-cycle completion signals.
pub mod signals;
/// Reference rendering surface.
pub mod surface;
/// Core traits for platform, network and display abstraction.
pub mod traits;

// Re-exports for convenience
pub use activity::ActivityLog;
pub use config::{Config, ConfigStore, DeviceState, JsonFileStore, MemoryStore, Settings};
pub use cycle::{
    CycleOutcome, CycleReport, CycleState, NetworkResolution, RenderResolution, UpdateCycle,
    UpdateCycleCoordinator,
};
pub use error::{
    ConfigError, CycleError, FetchError, PlatformError, PowerError, SetupError, TransportError,
    UpdateError,
};
pub use fetch::{DisplayPayload, Registration, RetryPolicy, UpdateFetcher};
pub use power::PowerController;
pub use scheduler::{CycleExecutor, ScheduledWake, Scheduler, Submission, TriggerSource};
pub use service::{StartOutcome, TriggerOutcome, UpdateService};
pub use signals::{CompletionSource, CycleListener, CycleSignals, UpdateRequest};
pub use surface::FetchingSurface;
pub use traits::{
    // Platform
    BatteryMonitor,
    Clock,
    PowerPlatform,
    SystemClock,
    WakeAlarm,
    // Network
    HttpClient,
    HttpRequest,
    HttpResponse,
    // Display
    DisplayFrame,
    DisplaySink,
    RenderSurface,
    StatusOverlay,
};
