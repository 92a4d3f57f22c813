//! Wake scheduling and cycle execution.
//!
//! | Type | Role |
//! |------|------|
//! | [`Scheduler`] | The single pending wake: RTC alarm + persisted timestamp + in-process timer |
//! | [`TriggerSource`] | Who asked for a cycle |
//! | [`CycleExecutor`] | At most one cycle in flight; extra submissions are coalesced |
//!
//! Triggers (timer expiry, headset insertion, boot) all flow through one
//! channel into the [`UpdateService`](crate::service::UpdateService), which
//! hands them to the executor.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{ConfigStore, SchedulerConfig};
use crate::cycle::{CycleReport, UpdateCycleCoordinator};
use crate::error::CycleError;
use crate::traits::{Clock, PowerPlatform, RenderSurface, WakeAlarm};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Trigger Source
// ============================================================================

/// Origin of a cycle request.
///
/// Only [`HeadphonePrimary`](Self::HeadphonePrimary) is authorized to cancel
/// a pending scheduled wake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TriggerSource {
    /// Headset jack insertion, the interactive wake path.
    HeadphonePrimary,
    /// The scheduled wake expired.
    Alarm,
    /// Daemon start with no future wake on record.
    Boot,
    /// Operator request.
    Manual,
}

impl TriggerSource {
    /// Returns the tag used in logs and the activity journal.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::HeadphonePrimary => "headphone_primary",
            TriggerSource::Alarm => "alarm_scheduler",
            TriggerSource::Boot => "boot",
            TriggerSource::Manual => "manual",
        }
    }

    /// Parse a trigger tag.
    ///
    /// Input is trimmed and case-insensitive; short forms are accepted.
    ///
    /// # Examples
    ///
    /// ```
    /// use nook_trmnl::TriggerSource;
    ///
    /// assert_eq!(TriggerSource::from_text("headphone_primary"), Some(TriggerSource::HeadphonePrimary));
    /// assert_eq!(TriggerSource::from_text(" Headphone "), Some(TriggerSource::HeadphonePrimary));
    /// assert_eq!(TriggerSource::from_text("alarm"), Some(TriggerSource::Alarm));
    /// assert_eq!(TriggerSource::from_text("usb"), None);
    /// ```
    pub fn from_text(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "headphone_primary" | "headphone" | "primary" => Some(TriggerSource::HeadphonePrimary),
            "alarm_scheduler" | "alarm" => Some(TriggerSource::Alarm),
            "boot" => Some(TriggerSource::Boot),
            "manual" => Some(TriggerSource::Manual),
            _ => None,
        }
    }

    /// Returns true for the source allowed to cancel a pending wake.
    pub const fn is_primary(&self) -> bool {
        matches!(self, TriggerSource::HeadphonePrimary)
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// The pending wake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduledWake {
    /// Due time, epoch ms.
    pub at_ms: u64,
    /// Bumped on every schedule/cancel; a timer only fires if it still matches.
    pub generation: u64,
}

#[derive(Debug, Default)]
struct SchedulerState {
    generation: u64,
    pending: Option<(ScheduledWake, JoinHandle<()>)>,
}

/// Durable "run the cycle at T" plus "run it now".
///
/// At most one wake is pending. Scheduling replaces the previous wake on
/// all three layers at once: the [`WakeAlarm`] (so a suspended device wakes),
/// the persisted next-wake timestamp (so a restart can re-arm it) and an
/// in-process timer (which actually emits [`TriggerSource::Alarm`]).
///
/// The timer compares against the wall [`Clock`], sleeping at most
/// `recheck_ms` at a time, so time spent suspended is accounted for.
pub struct Scheduler<A> {
    alarm: A,
    clock: Arc<dyn Clock>,
    store: Arc<dyn ConfigStore>,
    config: SchedulerConfig,
    triggers: mpsc::UnboundedSender<TriggerSource>,
    state: Arc<Mutex<SchedulerState>>,
}

impl<A: WakeAlarm> Scheduler<A> {
    /// Create a scheduler emitting triggers into `triggers`.
    pub fn new(
        alarm: A,
        clock: Arc<dyn Clock>,
        store: Arc<dyn ConfigStore>,
        config: SchedulerConfig,
        triggers: mpsc::UnboundedSender<TriggerSource>,
    ) -> Self {
        Self {
            alarm,
            clock,
            store,
            config,
            triggers,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    /// The hardware alarm.
    pub fn alarm(&self) -> &A {
        &self.alarm
    }

    /// Replace any pending wake with one at `at_ms` (epoch ms).
    ///
    /// The in-process timer is always armed. An error means the hardware
    /// alarm could not be set, so the wake will be missed if the device
    /// suspends before it is due.
    pub fn schedule_cycle_at(&self, at_ms: u64) -> Result<ScheduledWake, CycleError> {
        let wake = {
            let mut state = lock(&self.state);
            state.generation += 1;
            if let Some((old, timer)) = state.pending.take() {
                timer.abort();
                debug!("replacing wake due at {}", old.at_ms);
            }
            let wake = ScheduledWake {
                at_ms,
                generation: state.generation,
            };
            let timer = tokio::spawn(run_timer(
                wake,
                Arc::clone(&self.state),
                Arc::clone(&self.clock),
                self.triggers.clone(),
                Duration::from_millis(self.config.recheck_ms.max(1)),
            ));
            state.pending = Some((wake, timer));
            wake
        };

        let in_secs = at_ms.saturating_sub(self.clock.now_ms()) / 1_000;
        info!("next wake scheduled at {at_ms} ({in_secs}s from now)");

        if let Err(e) = self.store.record_next_wake(Some(at_ms)) {
            warn!("could not persist next wake: {e}");
        }
        self.alarm
            .arm(at_ms)
            .map_err(|e| CycleError::Scheduling(e.to_string()))?;
        Ok(wake)
    }

    /// Event-driven wake.
    ///
    /// The primary source cancels the pending wake first; every source is
    /// then forwarded to the trigger channel.
    pub fn trigger_now(&self, source: TriggerSource) {
        if source.is_primary() {
            if let Some(wake) = self.cancel() {
                info!("{source} cancelled wake due at {}", wake.at_ms);
            }
        }
        if self.triggers.send(source).is_err() {
            warn!("trigger {source} dropped: service is gone");
        }
    }

    /// Cancel the pending wake, if any.
    pub fn cancel(&self) -> Option<ScheduledWake> {
        let cancelled = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.pending.take().map(|(wake, timer)| {
                timer.abort();
                wake
            })
        };
        if cancelled.is_some() {
            if let Err(e) = self.alarm.disarm() {
                warn!("could not disarm wake alarm: {e}");
            }
            if let Err(e) = self.store.record_next_wake(None) {
                warn!("could not clear persisted wake: {e}");
            }
        }
        cancelled
    }

    /// The pending wake, if any.
    pub fn pending(&self) -> Option<ScheduledWake> {
        lock(&self.state).pending.as_ref().map(|(wake, _)| *wake)
    }
}

impl<A> fmt::Debug for Scheduler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

async fn run_timer(
    wake: ScheduledWake,
    state: Arc<Mutex<SchedulerState>>,
    clock: Arc<dyn Clock>,
    triggers: mpsc::UnboundedSender<TriggerSource>,
    recheck: Duration,
) {
    loop {
        let now = clock.now_ms();
        if now >= wake.at_ms {
            break;
        }
        let remaining = Duration::from_millis(wake.at_ms - now);
        tokio::time::sleep(remaining.min(recheck)).await;
    }

    {
        let mut state = lock(&state);
        let current = state.pending.as_ref().map(|(w, _)| w.generation);
        if current != Some(wake.generation) {
            debug!("stale wake (generation {}) ignored", wake.generation);
            return;
        }
        // detaches this task's own handle
        state.pending = None;
    }

    info!("scheduled wake due at {} fired", wake.at_ms);
    if triggers.send(TriggerSource::Alarm).is_err() {
        warn!("scheduled wake dropped: service is gone");
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Result of [`CycleExecutor::submit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    /// A new cycle was started.
    Started,
    /// A cycle was already running; the request was folded into it.
    Coalesced,
}

/// Runs cycles one at a time.
///
/// A submission while a cycle is in flight is coalesced into that cycle,
/// never queued and never interrupting it. A cycle that panics is reported
/// as [`CycleError::Panicked`] and the coordinator's recovery path (sleep,
/// retry scheduling) runs in its place.
pub struct CycleExecutor<P, R, A> {
    coordinator: Arc<UpdateCycleCoordinator<P, R, A>>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    coalesced: AtomicUsize,
    reports: Option<mpsc::UnboundedSender<CycleReport>>,
}

impl<P, R, A> CycleExecutor<P, R, A>
where
    P: PowerPlatform + 'static,
    R: RenderSurface + 'static,
    A: WakeAlarm + 'static,
{
    /// Executor for `coordinator`.
    pub fn new(coordinator: Arc<UpdateCycleCoordinator<P, R, A>>) -> Self {
        Self {
            coordinator,
            in_flight: Mutex::new(None),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            coalesced: AtomicUsize::new(0),
            reports: None,
        }
    }

    /// Send every finished cycle's report to `tx`.
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<CycleReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// The coordinator cycles run on.
    pub fn coordinator(&self) -> &Arc<UpdateCycleCoordinator<P, R, A>> {
        &self.coordinator
    }

    /// Start a cycle unless one is already running.
    pub fn submit(&self, source: TriggerSource) -> Submission {
        let mut in_flight = lock(&self.in_flight);
        if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
            self.coalesced.fetch_add(1, Ordering::SeqCst);
            info!("cycle already running, {source} trigger coalesced");
            return Submission::Coalesced;
        }

        // counted before spawning so a racing submit sees it
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let coordinator = Arc::clone(&self.coordinator);
        let active = Arc::clone(&self.active);
        let reports = self.reports.clone();
        *in_flight = Some(tokio::spawn(async move {
            let cycle = tokio::spawn({
                let coordinator = Arc::clone(&coordinator);
                async move { coordinator.run_cycle(source).await }
            });
            let report = match cycle.await {
                Ok(report) => report,
                Err(e) => {
                    error!("cycle task failed: {e}");
                    coordinator.recover(source, CycleError::Panicked).await
                }
            };
            active.fetch_sub(1, Ordering::SeqCst);
            if let Some(tx) = reports {
                let _ = tx.send(report);
            }
        }));
        Submission::Started
    }

    /// Cycles currently running (0 or 1).
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of cycles ever running at once.
    pub fn peak_active(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of submissions folded into a running cycle.
    pub fn coalesced(&self) -> usize {
        self.coalesced.load(Ordering::SeqCst)
    }

    /// Returns true while a cycle is in flight.
    pub fn is_busy(&self) -> bool {
        lock(&self.in_flight)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
