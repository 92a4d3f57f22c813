//! Trigger handling for the long-running daemon.
//!
//! [`UpdateService`] is the one consumer of the trigger channel the
//! [`Scheduler`] and the platform monitors feed. It applies the per-source
//! policy and hands cycles to the [`CycleExecutor`].

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::mpsc;

use crate::config::ConfigStore;
use crate::scheduler::{CycleExecutor, ScheduledWake, Scheduler, Submission, TriggerSource};
use crate::traits::{Clock, PowerPlatform, RenderSurface, WakeAlarm};

/// What [`UpdateService::handle`] did with a trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Handed to the executor.
    Submitted(Submission),
    /// Alarm ignored: the primary source drives wakes on this device.
    Deferred,
}

/// What [`UpdateService::start`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// A persisted wake was still in the future and has been re-armed.
    Restored(ScheduledWake),
    /// A boot cycle was started.
    Triggered(TriggerOutcome),
}

/// Routes triggers into cycles.
pub struct UpdateService<P, R, A> {
    executor: CycleExecutor<P, R, A>,
    scheduler: Arc<Scheduler<A>>,
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
}

impl<P, R, A> UpdateService<P, R, A>
where
    P: PowerPlatform + 'static,
    R: RenderSurface + 'static,
    A: WakeAlarm + 'static,
{
    /// Service over `executor`, re-arming wakes on `scheduler`.
    pub fn new(
        executor: CycleExecutor<P, R, A>,
        scheduler: Arc<Scheduler<A>>,
        store: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            scheduler,
            store,
            clock,
        }
    }

    /// The executor cycles run on.
    pub fn executor(&self) -> &CycleExecutor<P, R, A> {
        &self.executor
    }

    /// Apply the trigger policy to one trigger.
    ///
    /// With `cycle.defer_alarm_to_primary` set, [`TriggerSource::Alarm`] is
    /// logged and dropped; every other source (and the alarm by default)
    /// re-enters the state machine.
    pub async fn handle(&self, source: TriggerSource) -> TriggerOutcome {
        let power = self.executor.coordinator().power();
        match power.power_state().await {
            Some(value) => info!("trigger {source}: power_enhance = {value}"),
            None => info!("trigger {source}: power_enhance unknown"),
        }

        if source == TriggerSource::Alarm {
            let defer = match self.store.load() {
                Ok(settings) => settings.config.cycle.defer_alarm_to_primary,
                Err(e) => {
                    warn!("could not load settings for trigger policy: {e}");
                    false
                }
            };
            if defer {
                info!("alarm fired, relying on headphone event for actual wake");
                return TriggerOutcome::Deferred;
            }
        }

        TriggerOutcome::Submitted(self.executor.submit(source))
    }

    /// Resume after a restart.
    ///
    /// A persisted wake still in the future is re-armed instead of running
    /// a cycle now.
    pub async fn start(&self) -> StartOutcome {
        let now = self.clock.now_ms();
        let persisted = match self.store.load() {
            Ok(settings) => settings.state.next_wake_at_ms,
            Err(e) => {
                warn!("could not load persisted wake: {e}");
                None
            }
        };

        if let Some(at_ms) = persisted.filter(|at| *at > now) {
            match self.scheduler.schedule_cycle_at(at_ms) {
                Ok(wake) => {
                    info!("restored wake due in {}s", (at_ms - now) / 1_000);
                    return StartOutcome::Restored(wake);
                }
                Err(e) => warn!("could not restore wake, updating now: {e}"),
            }
        }
        StartOutcome::Triggered(self.handle(TriggerSource::Boot).await)
    }

    /// Start, then serve triggers until every sender is gone.
    pub async fn run(&self, mut triggers: mpsc::UnboundedReceiver<TriggerSource>) {
        self.start().await;
        while let Some(source) = triggers.recv().await {
            self.handle(source).await;
        }
        info!("trigger channel closed, service stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, CycleConfig, MemoryStore, PowerConfig, SchedulerConfig};
    use crate::cycle::UpdateCycleCoordinator;
    use crate::hal::{MockAlarm, MockClock, MockPower, MockSurface, SurfaceScript};
    use crate::power::PowerController;
    use std::time::Duration;

    const T0: u64 = 1_700_000_000_000;

    type Service = UpdateService<MockPower, MockSurface, MockAlarm>;

    fn service(config: Config) -> (Service, MockSurface, Arc<MemoryStore>, mpsc::UnboundedReceiver<TriggerSource>) {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::at(T0));
        let store = Arc::new(MemoryStore::with_config(config));
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler::new(
            MockAlarm::new(),
            Arc::clone(&clock),
            store.clone(),
            SchedulerConfig::default(),
            tx,
        ));
        let surface = MockSurface::new(SurfaceScript::completes(
            Duration::from_secs(1),
            60,
            Duration::from_secs(1),
        ));
        let coordinator = Arc::new(UpdateCycleCoordinator::new(
            PowerController::new(MockPower::connected(), PowerConfig::default()),
            surface.clone(),
            Arc::clone(&scheduler),
            store.clone(),
            Arc::clone(&clock),
        ));
        let service = UpdateService::new(CycleExecutor::new(coordinator), scheduler, store.clone(), clock);
        (service, surface, store, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_alarm_does_not_start_a_cycle() {
        let config = Config::default().with_cycle(CycleConfig::default().with_defer_alarm_to_primary(true));
        let (service, surface, _store, _rx) = service(config);

        assert_eq!(service.handle(TriggerSource::Alarm).await, TriggerOutcome::Deferred);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(surface.request_count(), 0);

        assert_eq!(
            service.handle(TriggerSource::HeadphonePrimary).await,
            TriggerOutcome::Submitted(Submission::Started)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn alarm_runs_a_cycle_by_default() {
        let (service, surface, _store, _rx) = service(Config::default());
        assert_eq!(
            service.handle(TriggerSource::Alarm).await,
            TriggerOutcome::Submitted(Submission::Started)
        );
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(surface.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_restores_future_wake() {
        let (service, surface, store, _rx) = service(Config::default());
        store.record_next_wake(Some(T0 + 120_000)).unwrap();

        match service.start().await {
            StartOutcome::Restored(wake) => assert_eq!(wake.at_ms, T0 + 120_000),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(surface.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_boot_cycle_when_wake_is_past() {
        let (service, surface, store, _rx) = service(Config::default());
        store.record_next_wake(Some(T0 - 1)).unwrap();

        assert_eq!(
            service.start().await,
            StartOutcome::Triggered(TriggerOutcome::Submitted(Submission::Started))
        );
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(surface.request_count(), 1);
    }
}
