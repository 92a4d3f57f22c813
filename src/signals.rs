//! Per-cycle completion signals between the rendering surface and the
//! coordinator.
//!
//! Each cycle gets a fresh pair of one-shot channels from [`cycle_channel`].
//! The surface holds the [`CycleSignals`] half and fires each signal at most
//! once; the coordinator holds the [`CycleListener`] half and awaits them
//! with a timeout. Once the coordinator stops listening (timeout, or the
//! cycle ended) the receiving side is closed, so a late signal is logged and
//! dropped instead of leaking into the next cycle.
//!
//! ```rust
//! use std::time::Duration;
//! use nook_trmnl::signals::{cycle_channel, CompletionSource, Wait};
//!
//! let rt = tokio::runtime::Builder::new_current_thread()
//!     .enable_time()
//!     .build()
//!     .unwrap();
//!
//! rt.block_on(async {
//!     let (signals, mut listener) = cycle_channel(1);
//!     assert!(signals.network_complete(300, CompletionSource::ApiResponse));
//!
//!     match listener.wait_network(Duration::from_secs(30)).await {
//!         Wait::Signaled(done) => assert_eq!(done.refresh_rate_secs, 300),
//!         other => panic!("unexpected {other:?}"),
//!     }
//!
//!     // A second network signal in the same cycle is ignored.
//!     assert!(!signals.network_complete(60, CompletionSource::ApiResponse));
//! });
//! ```

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::oneshot;

use crate::config::Config;

/// Where a reported refresh rate came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionSource {
    /// Parsed from a successful display response.
    ApiResponse,
    /// Fetch failed; the surface echoed back the fallback rate.
    ErrorFallback,
}

impl CompletionSource {
    /// Tag used in logs and the activity journal.
    pub const fn as_str(&self) -> &'static str {
        match self {
            CompletionSource::ApiResponse => "api_response",
            CompletionSource::ErrorFallback => "error_fallback",
        }
    }
}

impl fmt::Display for CompletionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The surface finished its network round trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkComplete {
    /// Refresh rate to use for the next wake. Non-positive values are ignored.
    pub refresh_rate_secs: i64,
    /// Where the rate came from.
    pub source: CompletionSource,
}

/// The surface finished painting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderComplete;

/// Outcome of waiting for one signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait<T> {
    /// The signal arrived in time.
    Signaled(T),
    /// The timeout elapsed first.
    TimedOut,
    /// The surface dropped its sender without signaling.
    Closed,
}

/// Create the signal pair for one cycle.
pub fn cycle_channel(cycle_id: u64) -> (CycleSignals, CycleListener) {
    let (network_tx, network_rx) = oneshot::channel();
    let (render_tx, render_rx) = oneshot::channel();
    (
        CycleSignals {
            cycle_id,
            network: Mutex::new(Some(network_tx)),
            render: Mutex::new(Some(render_tx)),
        },
        CycleListener {
            cycle_id,
            network: network_rx,
            render: render_rx,
        },
    )
}

/// Sending half, owned by the rendering surface.
#[derive(Debug)]
pub struct CycleSignals {
    cycle_id: u64,
    network: Mutex<Option<oneshot::Sender<NetworkComplete>>>,
    render: Mutex<Option<oneshot::Sender<RenderComplete>>>,
}

impl CycleSignals {
    /// Cycle these signals belong to.
    pub fn cycle_id(&self) -> u64 {
        self.cycle_id
    }

    /// Report network completion. Returns true if the coordinator received it.
    pub fn network_complete(&self, refresh_rate_secs: i64, source: CompletionSource) -> bool {
        let sender = self.network.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(sender) = sender else {
            warn!("cycle {}: duplicate network-complete ignored", self.cycle_id);
            return false;
        };
        let delivered = sender
            .send(NetworkComplete {
                refresh_rate_secs,
                source,
            })
            .is_ok();
        if !delivered {
            debug!(
                "cycle {}: late network-complete ({}s from {}) ignored",
                self.cycle_id, refresh_rate_secs, source
            );
        }
        delivered
    }

    /// Report render completion. Returns true if the coordinator received it.
    pub fn render_complete(&self) -> bool {
        let sender = self.render.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(sender) = sender else {
            warn!("cycle {}: duplicate render-complete ignored", self.cycle_id);
            return false;
        };
        let delivered = sender.send(RenderComplete).is_ok();
        if !delivered {
            debug!("cycle {}: late render-complete ignored", self.cycle_id);
        }
        delivered
    }
}

/// Receiving half, owned by the coordinator for one cycle.
#[derive(Debug)]
pub struct CycleListener {
    cycle_id: u64,
    network: oneshot::Receiver<NetworkComplete>,
    render: oneshot::Receiver<RenderComplete>,
}

impl CycleListener {
    /// Cycle this listener belongs to.
    pub fn cycle_id(&self) -> u64 {
        self.cycle_id
    }

    /// Wait up to `timeout` for network completion.
    ///
    /// On timeout the channel is closed, so a later signal is rejected.
    pub async fn wait_network(&mut self, timeout: Duration) -> Wait<NetworkComplete> {
        let wait = race(&mut self.network, timeout).await;
        if !matches!(wait, Wait::Signaled(_)) {
            self.network.close();
        }
        wait
    }

    /// Wait up to `timeout` for render completion.
    ///
    /// On timeout the channel is closed, so a later signal is rejected.
    pub async fn wait_render(&mut self, timeout: Duration) -> Wait<RenderComplete> {
        let wait = race(&mut self.render, timeout).await;
        if !matches!(wait, Wait::Signaled(_)) {
            self.render.close();
        }
        wait
    }

    /// Stop listening for anything further this cycle.
    pub fn close(&mut self) {
        self.network.close();
        self.render.close();
    }
}

async fn race<T>(rx: &mut oneshot::Receiver<T>, timeout: Duration) -> Wait<T> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Wait::Signaled(value),
        Ok(Err(_)) => Wait::Closed,
        Err(_) => Wait::TimedOut,
    }
}

/// What the coordinator hands the rendering surface at the start of a cycle.
#[derive(Debug)]
pub struct UpdateRequest {
    /// Monotonic cycle number, for logs.
    pub cycle_id: u64,
    /// Configuration snapshot taken at cycle start.
    pub config: Config,
    /// Refresh rate to echo back if the fetch fails.
    pub fallback_refresh_secs: u32,
    /// Completion signals for this cycle.
    pub signals: CycleSignals,
}
