//! Integration tests for the update cycle coordinator
//!
//! All timing assertions run on tokio's paused clock, so they are exact.

use std::sync::Arc;
use std::time::Duration;

use nook_trmnl::config::{
    Config, CycleConfig, MemoryStore, PowerConfig, SchedulerConfig, Settings,
};
use nook_trmnl::hal::{
    MockAlarm, MockBattery, MockClock, MockDisplay, MockHttp, MockPower, MockSurface, PowerCall,
    SurfaceScript,
};
use nook_trmnl::signals::UpdateRequest;
use nook_trmnl::traits::{Clock, HttpResponse, RenderSurface};
use nook_trmnl::{
    CompletionSource, ConfigError, ConfigStore, CycleError, CycleExecutor, CycleOutcome, CycleState,
    FetchingSurface, NetworkResolution, PowerController, RenderResolution, Scheduler, Submission,
    TriggerSource, UpdateCycleCoordinator,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

const T0: u64 = 1_700_000_000_000;
const PAYLOAD: &str =
    r#"{"image_url":"http://img.test/y.png?a\u0026b=1","refresh_rate":300,"filename":"y.png"}"#;

struct Rig<R> {
    power: MockPower,
    clock: MockClock,
    store: Arc<MemoryStore>,
    alarm: MockAlarm,
    scheduler: Arc<Scheduler<MockAlarm>>,
    coordinator: Arc<UpdateCycleCoordinator<MockPower, R, MockAlarm>>,
}

fn rig<R: RenderSurface + 'static>(power: MockPower, config: Config, surface: impl FnOnce(Arc<MemoryStore>, Arc<dyn Clock>) -> R) -> Rig<R> {
    let clock = MockClock::at(T0);
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(MemoryStore::with_config(config));
    let alarm = MockAlarm::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let scheduler = Arc::new(Scheduler::new(
        alarm.clone(),
        Arc::clone(&shared_clock),
        store.clone(),
        SchedulerConfig::default(),
        tx,
    ));
    let surface = surface(store.clone(), Arc::clone(&shared_clock));
    let coordinator = Arc::new(UpdateCycleCoordinator::new(
        PowerController::new(power.clone(), PowerConfig::default().with_polling(500, 4)),
        surface,
        Arc::clone(&scheduler),
        store.clone(),
        shared_clock,
    ));
    Rig {
        power,
        clock,
        store,
        alarm,
        scheduler,
        coordinator,
    }
}

fn mock_rig(power: MockPower, surface: MockSurface) -> Rig<MockSurface> {
    rig(power, Config::default(), |_, _| surface)
}

fn fetching_rig(
    http: MockHttp,
) -> Rig<FetchingSurface<MockHttp, MockDisplay, MockBattery>> {
    let config = Config::default()
        .with_server(nook_trmnl::config::ServerConfig::default().with_base_url("http://trmnl.test"));
    rig(MockPower::connected(), config, |store, clock| {
        FetchingSurface::new(
            http,
            MockDisplay::new().with_dimensions(800, 600),
            MockBattery::at(90),
            store,
            clock,
        )
    })
}

// ============================================================================
// Fetch retries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn fetch_failures_then_success_use_the_last_result() {
    for failures in 0..3u32 {
        let http = MockHttp::new()
            .route("/api/setup/", HttpResponse::ok_json("{}"))
            .route("img.test", HttpResponse::ok(vec![1]));
        for _ in 0..failures {
            http.push("/api/display", Ok(HttpResponse::error(502, "bad gateway")));
        }
        http.push("/api/display", Ok(HttpResponse::ok_json(PAYLOAD)));

        let rig = fetching_rig(http.clone());
        let report = rig.coordinator.run_cycle(TriggerSource::Manual).await;

        assert!(report.is_success(), "failures = {failures}");
        assert_eq!(report.cycle.effective_refresh_secs, 300);
        assert_eq!(rig.store.snapshot().state.refresh_rate_secs, 300);

        let calls = http.requests_to("/api/display");
        assert_eq!(calls.len() as u32, failures + 1);
        let backoff = calls.last().unwrap().0 - calls[0].0;
        assert_eq!(backoff, Duration::from_secs(u64::from(failures)));

        let image = &http.requests_to("img.test")[0].1;
        assert_eq!(image.url, "http://img.test/y.png?a&b=1");
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_fetch_falls_back_to_previous_rate() {
    let http = MockHttp::new()
        .route("/api/setup/", HttpResponse::ok_json("{}"))
        .route("/api/display", HttpResponse::error(500, "down"));
    let rig = fetching_rig(http.clone());
    rig.store.record_refresh_rate(900).unwrap();

    let report = rig.coordinator.run_cycle(TriggerSource::Alarm).await;

    assert_eq!(http.requests_to("/api/display").len(), 3);
    assert_eq!(report.cycle.effective_refresh_secs, 900);
    assert_eq!(rig.store.snapshot().state.refresh_rate_secs, 900);
    match report.outcome {
        CycleOutcome::Completed { network, render, .. } => {
            assert_eq!(
                network,
                NetworkResolution::Completed {
                    refresh_rate_secs: 900,
                    source: CompletionSource::ErrorFallback,
                }
            );
            // the surface never confirms a paint after a failed fetch
            assert_eq!(render, RenderResolution::SurfaceGone);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(rig.power.sleep_count(), 1);
}

// ============================================================================
// Connectivity
// ============================================================================

#[tokio::test(start_paused = true)]
async fn connectivity_exhaustion_sleeps_and_retries_shortly() {
    let surface = MockSurface::new(SurfaceScript::completes(
        Duration::from_secs(1),
        300,
        Duration::from_secs(1),
    ));
    let rig = mock_rig(MockPower::offline(), surface.clone());
    let start = Instant::now();

    let report = rig.coordinator.run_cycle(TriggerSource::Alarm).await;

    // wake 400ms, 3 x 2s of polling, backoff 2s + 4s, sleep 250ms
    assert_eq!(start.elapsed(), Duration::from_millis(12_650));
    assert_eq!(surface.request_count(), 0);
    assert_eq!(report.cycle.attempt_count, 3);
    match report.outcome {
        CycleOutcome::Retry {
            next_wake_at_ms,
            reason: CycleError::ConnectivityTimeout { attempts: 3 },
        } => assert_eq!(next_wake_at_ms, T0 + 12_650 + 30_000),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(rig.alarm.armed(), Some(T0 + 42_650));
    assert_eq!(rig.power.sleep_count(), 1);
    assert!(!rig.power.radio_on());
}

#[tokio::test(start_paused = true)]
async fn link_on_second_attempt_is_used() {
    let surface = MockSurface::new(SurfaceScript::completes(
        Duration::from_secs(1),
        120,
        Duration::from_secs(1),
    ));
    // 4 failed polls exhaust the first attempt, the 5th poll connects
    let rig = mock_rig(MockPower::connects_after(4), surface.clone());

    let report = rig.coordinator.run_cycle(TriggerSource::Manual).await;
    assert!(report.is_success());
    assert_eq!(report.cycle.attempt_count, 2);
    assert_eq!(surface.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_policy_sets_rounds_and_backoff() {
    let config =
        Config::default().with_cycle(CycleConfig::default().with_connect_policy(2, 1_000));
    let surface = MockSurface::new(SurfaceScript::silent());
    let rig = rig(MockPower::offline(), config, |_, _| surface.clone());
    let start = Instant::now();

    let report = rig.coordinator.run_cycle(TriggerSource::Alarm).await;

    // wake 400ms, 2 x 2s of polling, one 1s backoff, sleep 250ms
    assert_eq!(start.elapsed(), Duration::from_millis(5_650));
    assert!(matches!(
        report.outcome,
        CycleOutcome::Retry {
            reason: CycleError::ConnectivityTimeout { attempts: 2 },
            ..
        }
    ));

    // the link and the surface recover before the retry
    rig.power.set_connect_after(Some(0));
    surface.set_script(SurfaceScript::completes(
        Duration::from_secs(1),
        120,
        Duration::from_secs(1),
    ));
    let report = rig.coordinator.run_cycle(TriggerSource::Alarm).await;
    assert!(report.is_success());
    assert_eq!(report.cycle.effective_refresh_secs, 120);
    assert_eq!(surface.request_count(), 1);
    assert_eq!(rig.power.sleep_count(), 2);
}

// ============================================================================
// Completion signals
// ============================================================================

#[tokio::test(start_paused = true)]
async fn network_timeout_uses_previous_rate_and_skips_render() {
    let surface = MockSurface::new(SurfaceScript::silent());
    let rig = mock_rig(MockPower::connected(), surface.clone());
    rig.store.record_refresh_rate(900).unwrap();

    let report = rig.coordinator.run_cycle(TriggerSource::Alarm).await;

    assert_eq!(surface.fallback_rates(), vec![900]);
    assert_eq!(report.cycle.effective_refresh_secs, 900);
    assert!(!report.cycle.network_complete);
    match report.outcome {
        CycleOutcome::Completed {
            network,
            render,
            next_wake_at_ms,
        } => {
            assert_eq!(network, NetworkResolution::TimedOut);
            assert_eq!(render, RenderResolution::Skipped);
            // request at 400ms, 30s timeout, 250ms sleep
            assert_eq!(next_wake_at_ms, T0 + 30_650 + 900_000);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(rig.power.sleep_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_render_signal_sleeps_at_render_timeout() {
    let surface = MockSurface::new(SurfaceScript::network_only(Duration::from_secs(5), 120));
    let rig = mock_rig(MockPower::connected(), surface.clone());

    let report = rig.coordinator.run_cycle(TriggerSource::Alarm).await;
    assert_eq!(report.cycle.effective_refresh_secs, 120);
    assert!(report.cycle.network_complete);
    assert!(!report.cycle.render_complete);

    let requested = surface.request_times()[0];
    let radio_off = rig
        .power
        .calls()
        .into_iter()
        .find(|(_, c)| *c == PowerCall::SetRadio(false))
        .map(|(t, _)| t)
        .unwrap();
    assert_eq!(radio_off - requested, Duration::from_secs(20));
    assert_eq!(
        rig.power.sleep_pulse_times()[0] - requested,
        Duration::from_millis(20_200)
    );
}

#[tokio::test(start_paused = true)]
async fn late_render_signal_is_ignored() {
    let surface = MockSurface::new(SurfaceScript::completes(
        Duration::from_secs(1),
        60,
        Duration::from_secs(20),
    ));
    let rig = mock_rig(MockPower::connected(), surface.clone());

    let report = rig.coordinator.run_cycle(TriggerSource::Alarm).await;
    assert!(!report.cycle.render_complete);

    // let the surface fire its late signal
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        surface.delivered(),
        vec![(1, "network", true), (1, "render", false)]
    );
    assert_eq!(rig.power.sleep_count(), 1);
}

struct DroppingSurface;

impl RenderSurface for DroppingSurface {
    fn request_update(&self, request: UpdateRequest) {
        drop(request);
    }
}

#[tokio::test(start_paused = true)]
async fn dropped_request_is_handled_like_a_timeout() {
    let rig = rig(MockPower::connected(), Config::default(), |_, _| DroppingSurface);
    let start = Instant::now();

    let report = rig.coordinator.run_cycle(TriggerSource::Manual).await;
    match report.outcome {
        CycleOutcome::Completed { network, render, .. } => {
            assert_eq!(network, NetworkResolution::SurfaceGone);
            assert_eq!(render, RenderResolution::Skipped);
        }
        other => panic!("unexpected {other:?}"),
    }
    // no waiting on a closed channel: wake 400ms + sleep 250ms
    assert_eq!(start.elapsed(), Duration::from_millis(650));
}

// ============================================================================
// Sleep exactly once
// ============================================================================

#[tokio::test(start_paused = true)]
async fn every_branch_sleeps_exactly_once() {
    let scripts = [
        SurfaceScript::completes(Duration::from_secs(1), 60, Duration::from_secs(1)),
        SurfaceScript::network_only(Duration::from_secs(1), 60),
        SurfaceScript::silent(),
    ];
    for script in scripts {
        let rig = mock_rig(MockPower::connected(), MockSurface::new(script));
        rig.coordinator.run_cycle(TriggerSource::Alarm).await;
        assert_eq!(rig.power.sleep_count(), 1, "{script:?}");
        assert!(!rig.power.hold_held());
        assert!(!rig.power.radio_on());
    }

    let rig = mock_rig(MockPower::offline(), MockSurface::new(SurfaceScript::silent()));
    rig.coordinator.run_cycle(TriggerSource::Alarm).await;
    assert_eq!(rig.power.sleep_count(), 1);
}

struct PanickingSurface;

impl RenderSurface for PanickingSurface {
    fn request_update(&self, _request: UpdateRequest) {
        panic!("surface torn down");
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_cycle_still_sleeps_and_retries() {
    let rig = rig(MockPower::connected(), Config::default(), |_, _| PanickingSurface);
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let executor = CycleExecutor::new(Arc::clone(&rig.coordinator)).with_reports(reports_tx);

    assert_eq!(executor.submit(TriggerSource::Manual), Submission::Started);
    let report = reports.recv().await.unwrap();

    assert!(matches!(
        report.outcome,
        CycleOutcome::Retry {
            reason: CycleError::Panicked,
            ..
        }
    ));
    assert_eq!(rig.power.sleep_count(), 1);
    assert!(!rig.power.hold_held());
    assert_eq!(rig.coordinator.state(), CycleState::Idle);
    assert_eq!(
        rig.scheduler.pending().map(|w| w.at_ms),
        Some(rig.clock.now_ms() + 30_000)
    );
    assert_eq!(executor.active(), 0);
}

#[tokio::test(start_paused = true)]
async fn power_step_failures_do_not_abort_the_cycle() {
    use nook_trmnl::hal::MockFault;

    let power = MockPower::connected()
        .with_fault(MockFault::WakeHold)
        .with_fault(MockFault::Toggle);
    let surface = MockSurface::new(SurfaceScript::completes(
        Duration::from_secs(1),
        60,
        Duration::from_secs(1),
    ));
    let rig = mock_rig(power, surface.clone());

    let report = rig.coordinator.run_cycle(TriggerSource::Manual).await;
    assert!(report.is_success());
    assert_eq!(surface.request_count(), 1);
    // both pulse phases were still attempted
    assert_eq!(rig.power.count(|c| *c == PowerCall::SetToggle(0)), 2);
    assert_eq!(rig.power.count(|c| *c == PowerCall::SetToggle(1)), 1);
    assert!(!rig.power.radio_on());
}

// ============================================================================
// Error paths
// ============================================================================

struct UnreadableStore;

impl ConfigStore for UnreadableStore {
    fn load(&self) -> Result<Settings, ConfigError> {
        Err(std::io::Error::other("settings unreadable").into())
    }

    fn update(&self, _change: &mut dyn FnMut(&mut Settings)) -> Result<(), ConfigError> {
        Err(std::io::Error::other("settings read-only").into())
    }
}

#[tokio::test(start_paused = true)]
async fn unreadable_settings_sleep_and_retry() {
    let clock = MockClock::at(T0);
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let store: Arc<dyn ConfigStore> = Arc::new(UnreadableStore);
    let alarm = MockAlarm::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let scheduler = Arc::new(Scheduler::new(
        alarm.clone(),
        Arc::clone(&shared_clock),
        Arc::clone(&store),
        SchedulerConfig::default(),
        tx,
    ));
    let power = MockPower::connected();
    let surface = MockSurface::new(SurfaceScript::completes(
        Duration::from_secs(1),
        300,
        Duration::from_secs(1),
    ));
    let coordinator = UpdateCycleCoordinator::new(
        PowerController::new(power.clone(), PowerConfig::default()),
        surface.clone(),
        Arc::clone(&scheduler),
        store,
        shared_clock,
    );

    let report = coordinator.run_cycle(TriggerSource::Alarm).await;

    let retry_at = clock.now_ms() + 30_000;
    match report.outcome {
        CycleOutcome::Retry {
            next_wake_at_ms,
            reason: CycleError::Config(_),
        } => assert_eq!(next_wake_at_ms, retry_at),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(power.sleep_count(), 1);
    assert!(!power.hold_held());
    assert!(!power.radio_on());
    assert_eq!(surface.request_count(), 0);
    assert_eq!(scheduler.pending().map(|w| w.at_ms), Some(retry_at));
    assert_eq!(alarm.armed(), Some(retry_at));
    assert_eq!(coordinator.state(), CycleState::Idle);
}

#[tokio::test(start_paused = true)]
async fn alarm_failure_after_render_is_a_retry() {
    let surface = MockSurface::new(SurfaceScript::completes(
        Duration::from_secs(1),
        300,
        Duration::from_secs(1),
    ));
    let rig = mock_rig(MockPower::connected(), surface.clone());
    rig.scheduler.alarm().set_failing(true);

    let report = rig.coordinator.run_cycle(TriggerSource::Manual).await;

    let next = rig.clock.now_ms() + 300_000;
    match report.outcome {
        CycleOutcome::Retry {
            next_wake_at_ms,
            reason: CycleError::Scheduling(_),
        } => assert_eq!(next_wake_at_ms, next),
        other => panic!("unexpected {other:?}"),
    }
    assert!(report.cycle.render_complete);
    assert_eq!(surface.request_count(), 1);
    assert_eq!(rig.power.sleep_count(), 1);
    assert!(!rig.power.hold_held());
    // the in-process timer still covers the wake
    assert_eq!(rig.scheduler.pending().map(|w| w.at_ms), Some(next));
    assert_eq!(rig.store.snapshot().state.next_wake_at_ms, Some(next));
    assert_eq!(rig.alarm.armed(), None);
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test(start_paused = true)]
async fn timeouts_come_from_config() {
    let config = Config::default().with_cycle(
        CycleConfig::default()
            .with_network_timeout_ms(10_000)
            .with_render_timeout_ms(2_000),
    );
    let surface = MockSurface::new(SurfaceScript::network_only(Duration::from_secs(1), 60));
    let rig = rig(MockPower::connected(), config, |_, _| surface.clone());

    rig.coordinator.run_cycle(TriggerSource::Manual).await;
    let requested = surface.request_times()[0];
    assert_eq!(
        rig.power.sleep_pulse_times()[0] - requested,
        Duration::from_millis(3_200)
    );
}
