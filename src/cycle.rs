//! The update cycle state machine.
//!
//! ```text
//! Idle -> ConnectingPower -> AwaitingNetworkCompletion -> AwaitingRenderCompletion -> Sleeping -> Idle
//!               |                        |
//!               | (no link)              | (timeout: render wait skipped)
//!               v                        v
//!            Sleeping                 Sleeping
//! ```
//!
//! Every path through a cycle, including a panic caught by the
//! [`CycleExecutor`](crate::scheduler::CycleExecutor), ends with exactly one
//! call to [`PowerController::sleep`] followed by scheduling the next wake.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;

use crate::activity::ActivityLog;
use crate::config::{ConfigStore, CycleConfig};
use crate::error::CycleError;
use crate::power::PowerController;
use crate::scheduler::{Scheduler, TriggerSource};
use crate::signals::{cycle_channel, CompletionSource, UpdateRequest, Wait};
use crate::traits::{Clock, PowerPlatform, RenderSurface, WakeAlarm};

// ============================================================================
// Types
// ============================================================================

/// Where the coordinator currently is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CycleState {
    /// No cycle running.
    #[default]
    Idle,
    /// Waking the device and waiting for a network link.
    ConnectingPower,
    /// The surface is fetching; waiting for its network signal.
    AwaitingNetworkCompletion,
    /// The surface is painting; waiting for its render signal.
    AwaitingRenderCompletion,
    /// Returning the device to low-power mode.
    Sleeping,
}

impl CycleState {
    /// Returns the name used in logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            CycleState::Idle => "idle",
            CycleState::ConnectingPower => "connecting_power",
            CycleState::AwaitingNetworkCompletion => "awaiting_network",
            CycleState::AwaitingRenderCompletion => "awaiting_render",
            CycleState::Sleeping => "sleeping",
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One wake, as it went.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateCycle {
    /// Monotonic cycle number.
    pub id: u64,
    /// What started it.
    pub source: TriggerSource,
    /// Epoch ms at start.
    pub started_at_ms: u64,
    /// The surface reported network completion in time.
    pub network_complete: bool,
    /// The surface reported render completion in time.
    pub render_complete: bool,
    /// Rate used for the next wake.
    pub effective_refresh_secs: u32,
    /// Connectivity attempts made.
    pub attempt_count: u32,
    /// This cycle put the device to sleep.
    pub slept: bool,
}

impl UpdateCycle {
    fn new(id: u64, source: TriggerSource, started_at_ms: u64, refresh_secs: u32) -> Self {
        Self {
            id,
            source,
            started_at_ms,
            network_complete: false,
            render_complete: false,
            effective_refresh_secs: refresh_secs,
            attempt_count: 0,
            slept: false,
        }
    }
}

/// How the network wait ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkResolution {
    /// Signaled with a rate.
    Completed {
        /// Rate as reported (may be non-positive, in which case it was ignored).
        refresh_rate_secs: i64,
        /// Where it came from.
        source: CompletionSource,
    },
    /// Nothing arrived before the timeout.
    TimedOut,
    /// The surface dropped the request without signaling.
    SurfaceGone,
}

/// How the render wait ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderResolution {
    /// Signaled.
    Completed,
    /// Nothing arrived before the timeout; the cycle went on anyway.
    TimedOut,
    /// Not waited for, because the network wait did not complete.
    Skipped,
    /// The surface dropped the request without signaling.
    SurfaceGone,
}

/// How a cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Fetched (or fell back), slept and rescheduled at the refresh rate.
    Completed {
        /// Epoch ms of the next wake.
        next_wake_at_ms: u64,
        /// Network wait result.
        network: NetworkResolution,
        /// Render wait result.
        render: RenderResolution,
    },
    /// Failed; slept and rescheduled at the retry interval.
    Retry {
        /// Epoch ms of the next wake.
        next_wake_at_ms: u64,
        /// Why.
        reason: CycleError,
    },
}

/// Finished cycle handed to the scheduling host.
#[derive(Debug)]
pub struct CycleReport {
    /// Cycle record.
    pub cycle: UpdateCycle,
    /// Result.
    pub outcome: CycleOutcome,
}

impl CycleReport {
    /// Returns true unless the cycle ended in a retry.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Completed { .. })
    }

    /// Epoch ms of the wake this cycle scheduled.
    pub fn next_wake_at_ms(&self) -> u64 {
        match self.outcome {
            CycleOutcome::Completed { next_wake_at_ms, .. }
            | CycleOutcome::Retry { next_wake_at_ms, .. } => next_wake_at_ms,
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Runs one wake/fetch/display/sleep cycle at a time.
///
/// The coordinator owns the per-cycle state (the completion flags and the
/// negotiated refresh rate); the rendering surface only ever sees the
/// signal half of a fresh [`cycle_channel`]. Settings are loaded once at
/// the start of each cycle.
///
/// Cycles must not overlap; [`CycleExecutor`](crate::scheduler::CycleExecutor)
/// guarantees that.
pub struct UpdateCycleCoordinator<P, R, A> {
    power: PowerController<P>,
    surface: R,
    scheduler: Arc<Scheduler<A>>,
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    journal: Option<ActivityLog>,
    state: watch::Sender<CycleState>,
    last_id: AtomicU64,
    slept: AtomicBool,
}

impl<P, R, A> UpdateCycleCoordinator<P, R, A>
where
    P: PowerPlatform,
    R: RenderSurface,
    A: WakeAlarm,
{
    /// Create an idle coordinator.
    pub fn new(
        power: PowerController<P>,
        surface: R,
        scheduler: Arc<Scheduler<A>>,
        store: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(CycleState::Idle);
        Self {
            power,
            surface,
            scheduler,
            store,
            clock,
            journal: None,
            state,
            last_id: AtomicU64::new(0),
            slept: AtomicBool::new(false),
        }
    }

    /// Also record every step in `journal`.
    pub fn with_journal(mut self, journal: ActivityLog) -> Self {
        self.journal = Some(journal);
        self
    }

    /// The power controller.
    pub fn power(&self) -> &PowerController<P> {
        &self.power
    }

    /// The rendering surface.
    pub fn surface(&self) -> &R {
        &self.surface
    }

    /// The scheduler next wakes are armed on.
    pub fn scheduler(&self) -> &Arc<Scheduler<A>> {
        &self.scheduler
    }

    /// Current state.
    pub fn state(&self) -> CycleState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<CycleState> {
        self.state.subscribe()
    }

    /// Run one full cycle.
    ///
    /// Never fails: errors end in [`CycleOutcome::Retry`] after the device
    /// has been put to sleep and a retry wake scheduled.
    pub async fn run_cycle(&self, source: TriggerSource) -> CycleReport {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.slept.store(false, Ordering::SeqCst);
        let defaults = CycleConfig::default();
        let mut cycle = UpdateCycle::new(
            id,
            source,
            self.clock.now_ms(),
            defaults.default_refresh_secs,
        );
        self.note(&format!("Starting update cycle {id} (trigger: {source})"));

        let settings = match self.store.load() {
            Ok(settings) => settings,
            Err(e) => {
                error!("cycle {id}: could not load settings: {e}");
                return self.fail(cycle, &defaults, e.into()).await;
            }
        };
        let config = &settings.config.cycle;
        let fallback = match settings.state.refresh_rate_secs {
            0 => config.default_refresh_secs.max(1),
            rate => rate,
        };
        cycle.effective_refresh_secs = fallback;

        // ConnectingPower
        self.transition(&cycle, CycleState::ConnectingPower);
        if let Err(e) = self.power.wake().await {
            warn!("cycle {id}: wake incomplete: {e}");
        }
        // Backoff runs only between rounds: after the last failed round the
        // cycle goes straight to sleep, so `n` rounds back off `n - 1` times.
        let attempts = config.connect_attempts.max(1);
        let mut connected = false;
        for attempt in 1..=attempts {
            cycle.attempt_count = attempt;
            if self.power.connect().await {
                connected = true;
                break;
            }
            if attempt < attempts {
                let backoff = config.connect_backoff(attempt);
                warn!(
                    "cycle {id}: no connectivity (attempt {attempt}/{attempts}), retrying in {}ms",
                    backoff.as_millis()
                );
                tokio::time::sleep(backoff).await;
            }
        }
        if !connected {
            self.note(&format!("No connectivity after {attempts} attempts"));
            return self
                .fail(cycle, config, CycleError::ConnectivityTimeout { attempts })
                .await;
        }
        self.note("Network connected");

        // AwaitingNetworkCompletion
        self.transition(&cycle, CycleState::AwaitingNetworkCompletion);
        let (signals, mut listener) = cycle_channel(id);
        self.surface.request_update(UpdateRequest {
            cycle_id: id,
            config: settings.config.clone(),
            fallback_refresh_secs: fallback,
            signals,
        });

        let network = match listener.wait_network(config.network_timeout()).await {
            Wait::Signaled(done) => {
                cycle.network_complete = true;
                self.note(&format!(
                    "Network completion: refresh {}s from {}",
                    done.refresh_rate_secs, done.source
                ));
                if done.refresh_rate_secs > 0 {
                    let rate = u32::try_from(done.refresh_rate_secs).unwrap_or(u32::MAX);
                    cycle.effective_refresh_secs = rate;
                    if done.source == CompletionSource::ApiResponse {
                        if let Err(e) = self.store.record_refresh_rate(rate) {
                            warn!("cycle {id}: could not persist refresh rate: {e}");
                        }
                    }
                } else {
                    warn!(
                        "cycle {id}: ignoring non-positive refresh rate {}, keeping {fallback}s",
                        done.refresh_rate_secs
                    );
                }
                NetworkResolution::Completed {
                    refresh_rate_secs: done.refresh_rate_secs,
                    source: done.source,
                }
            }
            Wait::TimedOut => {
                warn!(
                    "cycle {id}: no network completion within {}ms, using {fallback}s",
                    config.network_timeout_ms
                );
                self.note("Network completion timed out");
                NetworkResolution::TimedOut
            }
            Wait::Closed => {
                warn!("cycle {id}: surface dropped the request, using {fallback}s");
                NetworkResolution::SurfaceGone
            }
        };

        // AwaitingRenderCompletion
        let render = if cycle.network_complete {
            self.transition(&cycle, CycleState::AwaitingRenderCompletion);
            match listener.wait_render(config.render_timeout()).await {
                Wait::Signaled(_) => {
                    cycle.render_complete = true;
                    self.note("Render complete");
                    RenderResolution::Completed
                }
                Wait::TimedOut => {
                    warn!(
                        "cycle {id}: no render completion within {}ms, sleeping anyway",
                        config.render_timeout_ms
                    );
                    RenderResolution::TimedOut
                }
                Wait::Closed => {
                    warn!("cycle {id}: surface gone before render completion");
                    RenderResolution::SurfaceGone
                }
            }
        } else {
            RenderResolution::Skipped
        };
        listener.close();

        // Sleeping
        self.transition(&cycle, CycleState::Sleeping);
        self.put_to_sleep(&mut cycle).await;

        let next_wake_at_ms = self.clock.now_ms() + u64::from(cycle.effective_refresh_secs) * 1_000;
        let outcome = match self.scheduler.schedule_cycle_at(next_wake_at_ms) {
            Ok(_) => {
                self.note(&format!(
                    "Next update in {}s",
                    cycle.effective_refresh_secs
                ));
                CycleOutcome::Completed {
                    next_wake_at_ms,
                    network,
                    render,
                }
            }
            Err(e) => {
                error!("cycle {id}: {e}");
                CycleOutcome::Retry {
                    next_wake_at_ms,
                    reason: e,
                }
            }
        };

        self.transition(&cycle, CycleState::Idle);
        info!("cycle {id} finished");
        CycleReport { cycle, outcome }
    }

    /// Clean up after a cycle that died without reporting.
    ///
    /// Puts the device to sleep unless the dead cycle already did, then
    /// schedules a retry.
    pub async fn recover(&self, source: TriggerSource, reason: CycleError) -> CycleReport {
        let id = self.last_id.load(Ordering::SeqCst);
        error!("cycle {id} aborted: {reason}");
        let config = self
            .store
            .load()
            .map(|s| s.config.cycle)
            .unwrap_or_default();
        let mut cycle = UpdateCycle::new(
            id,
            source,
            self.clock.now_ms(),
            config.default_refresh_secs,
        );
        cycle.slept = self.slept.load(Ordering::SeqCst);
        self.fail(cycle, &config, reason).await
    }

    async fn fail(
        &self,
        mut cycle: UpdateCycle,
        config: &CycleConfig,
        reason: CycleError,
    ) -> CycleReport {
        self.transition(&cycle, CycleState::Sleeping);
        self.put_to_sleep(&mut cycle).await;

        let next_wake_at_ms =
            self.clock.now_ms() + u64::from(config.retry_interval_secs) * 1_000;
        if let Err(e) = self.scheduler.schedule_cycle_at(next_wake_at_ms) {
            error!("cycle {}: retry wake: {e}", cycle.id);
        }
        self.note(&format!(
            "Cycle failed ({reason}), retrying in {}s",
            config.retry_interval_secs
        ));

        self.transition(&cycle, CycleState::Idle);
        CycleReport {
            cycle,
            outcome: CycleOutcome::Retry {
                next_wake_at_ms,
                reason,
            },
        }
    }

    async fn put_to_sleep(&self, cycle: &mut UpdateCycle) {
        if self.slept.swap(true, Ordering::SeqCst) {
            return;
        }
        cycle.slept = true;
        self.note("Going back to sleep");
        if let Err(e) = self.power.sleep().await {
            warn!("cycle {}: sleep incomplete: {e}", cycle.id);
        }
    }

    fn transition(&self, cycle: &UpdateCycle, next: CycleState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!("cycle {}: {prev} -> {next}", cycle.id);
        }
    }

    fn note(&self, message: &str) {
        info!("{message}");
        if let Some(journal) = &self.journal {
            journal.record(message);
        }
    }
}

impl<P, R, A> fmt::Debug for UpdateCycleCoordinator<P, R, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateCycleCoordinator")
            .field("state", &*self.state.borrow())
            .field("last_id", &self.last_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, MemoryStore, PowerConfig, SchedulerConfig};
    use crate::hal::{MockAlarm, MockClock, MockPower, MockSurface, PowerCall, SurfaceScript};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const T0: u64 = 1_700_000_000_000;

    type Coordinator = UpdateCycleCoordinator<MockPower, MockSurface, MockAlarm>;

    fn coordinator(power: MockPower, surface: MockSurface) -> (Coordinator, Arc<MemoryStore>) {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::at(T0));
        let store = Arc::new(MemoryStore::with_config(Config::default()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler::new(
            MockAlarm::new(),
            Arc::clone(&clock),
            store.clone(),
            SchedulerConfig::default(),
            tx,
        ));
        let power = PowerController::new(power, PowerConfig::default().with_polling(500, 4));
        let coordinator = UpdateCycleCoordinator::new(power, surface, scheduler, store.clone(), clock);
        (coordinator, store)
    }

    // =========================================================================
    // State machine
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn walks_every_state_in_order() {
        let surface = MockSurface::new(SurfaceScript::completes(
            Duration::from_secs(2),
            120,
            Duration::from_secs(1),
        ));
        let (coordinator, _store) = coordinator(MockPower::connected(), surface);
        let mut states = coordinator.subscribe();

        let seen = tokio::spawn(async move {
            let mut seen = Vec::new();
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                seen.push(state);
                if state == CycleState::Idle {
                    break;
                }
            }
            seen
        });

        let report = coordinator.run_cycle(TriggerSource::Manual).await;
        assert!(report.is_success());
        assert_eq!(
            seen.await.unwrap(),
            vec![
                CycleState::ConnectingPower,
                CycleState::AwaitingNetworkCompletion,
                CycleState::AwaitingRenderCompletion,
                CycleState::Sleeping,
                CycleState::Idle,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn api_rate_is_persisted_and_used() {
        let surface = MockSurface::new(SurfaceScript::completes(
            Duration::from_secs(1),
            300,
            Duration::from_secs(1),
        ));
        let (coordinator, store) = coordinator(MockPower::connected(), surface);

        let report = coordinator.run_cycle(TriggerSource::Boot).await;
        assert_eq!(report.cycle.effective_refresh_secs, 300);
        assert!(report.cycle.network_complete);
        assert!(report.cycle.render_complete);
        assert_eq!(store.snapshot().state.refresh_rate_secs, 300);
        assert_eq!(
            coordinator.scheduler().pending().map(|w| w.at_ms),
            Some(report.next_wake_at_ms())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_positive_rate_keeps_previous() {
        let surface = MockSurface::new(SurfaceScript::completes(
            Duration::from_secs(1),
            0,
            Duration::from_secs(1),
        ));
        let (coordinator, store) = coordinator(MockPower::connected(), surface);
        store.record_refresh_rate(900).unwrap();

        let report = coordinator.run_cycle(TriggerSource::Alarm).await;
        assert_eq!(report.cycle.effective_refresh_secs, 900);
        assert_eq!(store.snapshot().state.refresh_rate_secs, 900);
    }

    #[tokio::test(start_paused = true)]
    async fn error_fallback_rate_is_not_persisted() {
        let surface = MockSurface::new(SurfaceScript {
            network: Some((Duration::from_secs(1), 45, CompletionSource::ErrorFallback)),
            render: None,
        });
        let (coordinator, store) = coordinator(MockPower::connected(), surface);

        let report = coordinator.run_cycle(TriggerSource::Alarm).await;
        assert_eq!(report.cycle.effective_refresh_secs, 45);
        assert_eq!(store.snapshot().state.refresh_rate_secs, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn wake_precedes_connect_and_sleep_ends_cycle() {
        let surface = MockSurface::new(SurfaceScript::completes(
            Duration::from_secs(1),
            60,
            Duration::from_secs(1),
        ));
        let power = MockPower::connected();
        let (coordinator, _store) = coordinator(power.clone(), surface);
        coordinator.run_cycle(TriggerSource::Manual).await;

        let calls: Vec<PowerCall> = power.calls().into_iter().map(|(_, c)| c).collect();
        assert!(matches!(calls[0], PowerCall::AcquireHold(_)));
        assert_eq!(calls.last(), Some(&PowerCall::ReadToggle));
        assert_eq!(power.sleep_count(), 1);
        assert!(!power.hold_held());
        assert!(!power.radio_on());
        assert_eq!(coordinator.state(), CycleState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_after_sleep_does_not_sleep_twice() {
        let surface = MockSurface::new(SurfaceScript::completes(
            Duration::from_secs(1),
            60,
            Duration::from_secs(1),
        ));
        let power = MockPower::connected();
        let (coordinator, _store) = coordinator(power.clone(), surface);
        coordinator.run_cycle(TriggerSource::Manual).await;

        let report = coordinator
            .recover(TriggerSource::Manual, CycleError::Panicked)
            .await;
        assert!(!report.is_success());
        assert_eq!(power.sleep_count(), 1);
    }
}
