//! Mock implementations for testing without a device.
//!
//! This module provides test doubles for every platform, network and
//! display trait, so the whole update cycle runs on a desktop under tokio's
//! paused clock.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockPower`] | [`PowerPlatform`] | Scripted connectivity, injectable faults, timestamped call log |
//! | [`MockBattery`] | [`BatteryMonitor`] | Fixed battery level |
//! | [`MockAlarm`] | [`WakeAlarm`] | Records arm/disarm |
//! | [`MockClock`] | [`Clock`] | Wall clock that follows tokio time |
//! | [`MockHttp`] | [`HttpClient`] | Per-route scripted replies, recorded requests |
//! | [`MockDisplay`] | [`DisplaySink`] | Records painted frames |
//! | [`MockSurface`] | [`RenderSurface`] | Scripted completion signals |
//!
//! All mocks are cheap to clone and share their state between clones, so a
//! test can keep a handle while the code under test owns another.
//!
//! # Example
//!
//! ```rust
//! use nook_trmnl::hal::MockAlarm;
//! use nook_trmnl::traits::WakeAlarm;
//!
//! let alarm = MockAlarm::new();
//! alarm.arm(60_000).unwrap();
//! alarm.arm(90_000).unwrap();
//!
//! assert_eq!(alarm.armed(), Some(90_000));
//! assert_eq!(alarm.arm_count(), 2);
//! ```
//!
//! [`PowerPlatform`]: crate::traits::PowerPlatform
//! [`BatteryMonitor`]: crate::traits::BatteryMonitor
//! [`WakeAlarm`]: crate::traits::WakeAlarm
//! [`Clock`]: crate::traits::Clock
//! [`HttpClient`]: crate::traits::HttpClient
//! [`DisplaySink`]: crate::traits::DisplaySink
//! [`RenderSurface`]: crate::traits::RenderSurface

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::signals::{CompletionSource, UpdateRequest};
use crate::traits::{
    BatteryMonitor, Clock, DisplayFrame, DisplaySink, HttpClient, HttpRequest, HttpResponse,
    PowerPlatform, RenderSurface, WakeAlarm,
};

/// Error returned by mocks with an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("injected failure: {0}")]
pub struct MockError(pub &'static str);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Power
// ============================================================================

/// A call made on [`MockPower`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PowerCall {
    /// `is_connected`
    IsConnected,
    /// `radio_enabled`
    RadioEnabled,
    /// `set_radio_enabled`
    SetRadio(bool),
    /// `power_enhance`
    ReadToggle,
    /// `set_power_enhance`
    SetToggle(i32),
    /// `acquire_wake_hold`
    AcquireHold(Duration),
    /// `release_wake_hold`
    ReleaseHold,
}

/// Operations that can be made to fail on [`MockPower`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MockFault {
    /// `is_connected` errors.
    Connectivity,
    /// `set_radio_enabled` errors.
    Radio,
    /// `set_power_enhance` errors.
    Toggle,
    /// `acquire_wake_hold` / `release_wake_hold` error.
    WakeHold,
}

#[derive(Debug)]
struct PowerState {
    radio: bool,
    link: bool,
    /// Failed polls with the radio on before the link comes up (`None` = never).
    connect_after: Option<u32>,
    polls: u32,
    toggle: i32,
    hold: bool,
    faults: HashSet<MockFault>,
    calls: Vec<(Instant, PowerCall)>,
}

/// Mock power platform.
///
/// Connectivity is scripted: once the radio is switched on, the link comes
/// up after a configured number of failed polls. Switching the radio off
/// drops the link. Every call is logged with its tokio timestamp, including
/// calls that fail because of an injected [`MockFault`].
///
/// # Example
///
/// ```rust
/// use nook_trmnl::hal::{MockPower, PowerCall};
///
/// let power = MockPower::connects_after(2);
/// assert!(!power.radio_on());
/// assert_eq!(power.count(|c| *c == PowerCall::IsConnected), 0);
/// ```
#[derive(Clone, Debug)]
pub struct MockPower {
    state: Arc<Mutex<PowerState>>,
}

impl MockPower {
    fn with_state(radio: bool, link: bool, connect_after: Option<u32>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PowerState {
                radio,
                link,
                connect_after,
                polls: 0,
                toggle: 1,
                hold: false,
                faults: HashSet::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Radio on and link up; the link returns on the first poll after a reconnect.
    pub fn connected() -> Self {
        Self::with_state(true, true, Some(0))
    }

    /// Radio off; the link never comes up.
    pub fn offline() -> Self {
        Self::with_state(false, false, None)
    }

    /// Radio off; the link comes up after `polls` failed polls with the radio on.
    pub fn connects_after(polls: u32) -> Self {
        Self::with_state(false, false, Some(polls))
    }

    /// Make an operation fail.
    pub fn with_fault(self, fault: MockFault) -> Self {
        lock(&self.state).faults.insert(fault);
        self
    }

    /// Remove an injected fault.
    pub fn clear_fault(&self, fault: MockFault) {
        lock(&self.state).faults.remove(&fault);
    }

    /// Change the link script mid-test (`None` = never connects).
    pub fn set_connect_after(&self, polls: Option<u32>) {
        let mut s = lock(&self.state);
        s.connect_after = polls;
        s.polls = 0;
    }

    /// All calls so far.
    pub fn calls(&self) -> Vec<(Instant, PowerCall)> {
        lock(&self.state).calls.clone()
    }

    /// Forget the call log.
    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    /// Number of calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&PowerCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|(_, c)| pred(c)).count()
    }

    /// Number of completed sleep pulses (writes of `1` to the toggle).
    pub fn sleep_count(&self) -> usize {
        self.count(|c| *c == PowerCall::SetToggle(1))
    }

    /// Timestamps of every write of `1` to the toggle.
    pub fn sleep_pulse_times(&self) -> Vec<Instant> {
        lock(&self.state)
            .calls
            .iter()
            .filter(|(_, c)| *c == PowerCall::SetToggle(1))
            .map(|(t, _)| *t)
            .collect()
    }

    /// Whether the radio is on.
    pub fn radio_on(&self) -> bool {
        lock(&self.state).radio
    }

    /// Whether the wake hold is held.
    pub fn hold_held(&self) -> bool {
        lock(&self.state).hold
    }

    /// Current toggle value.
    pub fn toggle(&self) -> i32 {
        lock(&self.state).toggle
    }

    fn log(&self, call: PowerCall) -> MutexGuard<'_, PowerState> {
        let mut s = lock(&self.state);
        s.calls.push((Instant::now(), call));
        s
    }

    fn check(s: &PowerState, fault: MockFault, what: &'static str) -> Result<(), MockError> {
        if s.faults.contains(&fault) {
            Err(MockError(what))
        } else {
            Ok(())
        }
    }
}

impl PowerPlatform for MockPower {
    type Error = MockError;

    async fn is_connected(&self) -> Result<bool, MockError> {
        let mut s = self.log(PowerCall::IsConnected);
        Self::check(&s, MockFault::Connectivity, "is_connected")?;
        if s.link {
            return Ok(true);
        }
        if !s.radio {
            return Ok(false);
        }
        match s.connect_after {
            Some(n) if s.polls >= n => {
                s.link = true;
                Ok(true)
            }
            Some(_) => {
                s.polls += 1;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn radio_enabled(&self) -> Result<bool, MockError> {
        Ok(self.log(PowerCall::RadioEnabled).radio)
    }

    async fn set_radio_enabled(&self, enabled: bool) -> Result<(), MockError> {
        let mut s = self.log(PowerCall::SetRadio(enabled));
        Self::check(&s, MockFault::Radio, "set_radio_enabled")?;
        s.radio = enabled;
        if !enabled {
            s.link = false;
            s.polls = 0;
        }
        Ok(())
    }

    async fn power_enhance(&self) -> Result<i32, MockError> {
        Ok(self.log(PowerCall::ReadToggle).toggle)
    }

    async fn set_power_enhance(&self, value: i32) -> Result<(), MockError> {
        let mut s = self.log(PowerCall::SetToggle(value));
        Self::check(&s, MockFault::Toggle, "set_power_enhance")?;
        s.toggle = value;
        Ok(())
    }

    async fn acquire_wake_hold(&self, ceiling: Duration) -> Result<(), MockError> {
        let mut s = self.log(PowerCall::AcquireHold(ceiling));
        Self::check(&s, MockFault::WakeHold, "acquire_wake_hold")?;
        s.hold = true;
        Ok(())
    }

    async fn release_wake_hold(&self) -> Result<(), MockError> {
        let mut s = self.log(PowerCall::ReleaseHold);
        // a failed release still lets the hold expire; model it as released
        s.hold = false;
        Self::check(&s, MockFault::WakeHold, "release_wake_hold")
    }

    fn wake_hold_held(&self) -> bool {
        lock(&self.state).hold
    }
}

// ============================================================================
// Battery / Alarm / Clock
// ============================================================================

/// Mock battery with a fixed level.
#[derive(Clone, Copy, Debug, Default)]
pub struct MockBattery {
    /// Level reported, `None` = unavailable.
    pub level: Option<u8>,
}

impl MockBattery {
    /// Battery reporting `level` percent.
    pub fn at(level: u8) -> Self {
        Self { level: Some(level) }
    }
}

impl BatteryMonitor for MockBattery {
    async fn battery_level(&self) -> Option<u8> {
        self.level
    }
}

/// What happened to a [`MockAlarm`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlarmEvent {
    /// Armed for the given epoch ms.
    Armed(u64),
    /// Cleared.
    Disarmed,
}

/// Mock wake alarm.
#[derive(Clone, Debug, Default)]
pub struct MockAlarm {
    events: Arc<Mutex<Vec<AlarmEvent>>>,
    fail: Arc<Mutex<bool>>,
}

impl MockAlarm {
    /// Creates a new, unarmed alarm.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `arm` fail.
    pub fn set_failing(&self, fail: bool) {
        *lock(&self.fail) = fail;
    }

    /// Every arm/disarm in order.
    pub fn events(&self) -> Vec<AlarmEvent> {
        lock(&self.events).clone()
    }

    /// Currently armed time, if any.
    pub fn armed(&self) -> Option<u64> {
        match lock(&self.events).last() {
            Some(AlarmEvent::Armed(at)) => Some(*at),
            _ => None,
        }
    }

    /// Number of successful `arm` calls.
    pub fn arm_count(&self) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| matches!(e, AlarmEvent::Armed(_)))
            .count()
    }
}

impl WakeAlarm for MockAlarm {
    type Error = MockError;

    fn arm(&self, at_ms: u64) -> Result<(), MockError> {
        if *lock(&self.fail) {
            return Err(MockError("arm"));
        }
        lock(&self.events).push(AlarmEvent::Armed(at_ms));
        Ok(())
    }

    fn disarm(&self) -> Result<(), MockError> {
        lock(&self.events).push(AlarmEvent::Disarmed);
        Ok(())
    }
}

/// Mock wall clock.
///
/// Reads `base + (tokio now - creation instant) + manual offset`, so under a
/// paused runtime it advances exactly with `tokio::time::sleep`. Use
/// [`advance`](Self::advance) to simulate a wall-clock jump (suspend, NTP).
#[derive(Clone, Debug)]
pub struct MockClock {
    base_ms: u64,
    anchor: Instant,
    offset_ms: Arc<AtomicU64>,
}

impl MockClock {
    /// Clock reading `base_ms` now.
    pub fn at(base_ms: u64) -> Self {
        Self {
            base_ms,
            anchor: Instant::now(),
            offset_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Jump the wall clock forward without moving tokio time.
    pub fn advance(&self, ms: u64) {
        self.offset_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::at(1_700_000_000_000)
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.base_ms
            + self.anchor.elapsed().as_millis() as u64
            + self.offset_ms.load(Ordering::SeqCst)
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// A scripted [`MockHttp`] reply.
pub type Reply = Result<HttpResponse, TransportError>;

#[derive(Debug, Default)]
struct HttpState {
    routes: Vec<(String, VecDeque<Reply>)>,
    requests: Vec<(Instant, HttpRequest)>,
}

/// Mock HTTP client.
///
/// Replies are queued per route; a route matches when its fragment appears
/// in the request URL. The last queued reply of a route repeats forever.
/// Unmatched requests get a 404.
///
/// # Example
///
/// ```rust
/// use nook_trmnl::hal::MockHttp;
/// use nook_trmnl::traits::HttpResponse;
///
/// let http = MockHttp::new()
///     .route("/api/setup/", HttpResponse::ok_json("{}"))
///     .route("/api/display", HttpResponse::error(500, "down"));
/// assert_eq!(http.request_count(), 0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct MockHttp {
    state: Arc<Mutex<HttpState>>,
}

impl MockHttp {
    /// Creates a client with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for URLs containing `fragment`.
    pub fn route(self, fragment: &str, response: HttpResponse) -> Self {
        self.push(fragment, Ok(response));
        self
    }

    /// Queue a transport failure for URLs containing `fragment`.
    pub fn route_error(self, fragment: &str, message: &str) -> Self {
        self.push(fragment, Err(TransportError::new(message)));
        self
    }

    /// Queue a reply on an existing client.
    pub fn push(&self, fragment: &str, reply: Reply) {
        let mut s = lock(&self.state);
        match s.routes.iter_mut().find(|(f, _)| f == fragment) {
            Some((_, queue)) => queue.push_back(reply),
            None => s.routes.push((fragment.to_string(), VecDeque::from([reply]))),
        }
    }

    /// Requests received so far, with timestamps.
    pub fn requests(&self) -> Vec<(Instant, HttpRequest)> {
        lock(&self.state).requests.clone()
    }

    /// Requests whose URL contains `fragment`.
    pub fn requests_to(&self, fragment: &str) -> Vec<(Instant, HttpRequest)> {
        lock(&self.state)
            .requests
            .iter()
            .filter(|(_, r)| r.url.contains(fragment))
            .cloned()
            .collect()
    }

    /// Total request count.
    pub fn request_count(&self) -> usize {
        lock(&self.state).requests.len()
    }
}

impl HttpClient for MockHttp {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut s = lock(&self.state);
        let reply = s
            .routes
            .iter_mut()
            .find(|(f, _)| request.url.contains(f.as_str()))
            .and_then(|(_, queue)| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            });
        s.requests.push((Instant::now(), request));
        reply.unwrap_or_else(|| Ok(HttpResponse::error(404, "not found")))
    }
}

// ============================================================================
// Display
// ============================================================================

#[derive(Debug, Default)]
struct DisplayState {
    frames: Vec<DisplayFrame>,
    dimensions: Option<(u32, u32)>,
    fail: bool,
}

/// Mock display sink recording every frame.
#[derive(Clone, Debug, Default)]
pub struct MockDisplay {
    state: Arc<Mutex<DisplayState>>,
}

impl MockDisplay {
    /// Panel with unknown dimensions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Panel reporting `width` x `height`.
    pub fn with_dimensions(self, width: u32, height: u32) -> Self {
        lock(&self.state).dimensions = Some((width, height));
        self
    }

    /// Make `show` fail.
    pub fn set_failing(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }

    /// Frames painted so far.
    pub fn frames(&self) -> Vec<DisplayFrame> {
        lock(&self.state).frames.clone()
    }

    /// Most recent frame.
    pub fn last_frame(&self) -> Option<DisplayFrame> {
        lock(&self.state).frames.last().cloned()
    }
}

impl DisplaySink for MockDisplay {
    type Error = MockError;

    async fn show(&self, frame: DisplayFrame) -> Result<(), MockError> {
        let mut s = lock(&self.state);
        if s.fail {
            return Err(MockError("show"));
        }
        s.frames.push(frame);
        Ok(())
    }

    async fn dimensions(&self) -> Option<(u32, u32)> {
        lock(&self.state).dimensions
    }
}

// ============================================================================
// Rendering Surface
// ============================================================================

/// Scripted behaviour of a [`MockSurface`] for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceScript {
    /// Delay and rate for the network signal (`None` = never sent).
    pub network: Option<(Duration, i64, CompletionSource)>,
    /// Delay after the network signal for the render signal (`None` = never sent).
    pub render: Option<Duration>,
}

impl SurfaceScript {
    /// Network after `after` with `rate`, render `render_after` later.
    pub fn completes(after: Duration, rate: i64, render_after: Duration) -> Self {
        Self {
            network: Some((after, rate, CompletionSource::ApiResponse)),
            render: Some(render_after),
        }
    }

    /// Network after `after` with `rate`; render never confirmed.
    pub fn network_only(after: Duration, rate: i64) -> Self {
        Self {
            network: Some((after, rate, CompletionSource::ApiResponse)),
            render: None,
        }
    }

    /// Nothing is ever signaled.
    pub fn silent() -> Self {
        Self {
            network: None,
            render: None,
        }
    }
}

#[derive(Debug)]
struct SurfaceState {
    script: SurfaceScript,
    requests: Vec<(Instant, u64, u32)>,
    delivered: Vec<(u64, &'static str, bool)>,
}

/// Mock rendering surface.
///
/// Each request spawns a task that fires the scripted signals. Signals
/// that are never fired are held until the task is dropped, so the
/// coordinator sees a timeout rather than a closed channel.
#[derive(Clone, Debug)]
pub struct MockSurface {
    state: Arc<Mutex<SurfaceState>>,
}

impl MockSurface {
    /// Surface following `script` for every request.
    pub fn new(script: SurfaceScript) -> Self {
        Self {
            state: Arc::new(Mutex::new(SurfaceState {
                script,
                requests: Vec::new(),
                delivered: Vec::new(),
            })),
        }
    }

    /// Replace the script for later requests.
    pub fn set_script(&self, script: SurfaceScript) {
        lock(&self.state).script = script;
    }

    /// Number of update requests received.
    pub fn request_count(&self) -> usize {
        lock(&self.state).requests.len()
    }

    /// Timestamps of update requests.
    pub fn request_times(&self) -> Vec<Instant> {
        lock(&self.state).requests.iter().map(|(t, _, _)| *t).collect()
    }

    /// Fallback rates passed with each request.
    pub fn fallback_rates(&self) -> Vec<u32> {
        lock(&self.state).requests.iter().map(|(_, _, r)| *r).collect()
    }

    /// `(cycle, signal, accepted)` for every signal fired.
    pub fn delivered(&self) -> Vec<(u64, &'static str, bool)> {
        lock(&self.state).delivered.clone()
    }
}

impl RenderSurface for MockSurface {
    fn request_update(&self, request: UpdateRequest) {
        let script = {
            let mut s = lock(&self.state);
            s.requests
                .push((Instant::now(), request.cycle_id, request.fallback_refresh_secs));
            s.script
        };
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let signals = request.signals;
            let Some((after, rate, source)) = script.network else {
                std::future::pending::<()>().await;
                return;
            };
            tokio::time::sleep(after).await;
            let ok = signals.network_complete(rate, source);
            lock(&state)
                .delivered
                .push((signals.cycle_id(), "network", ok));

            let Some(render_after) = script.render else {
                std::future::pending::<()>().await;
                return;
            };
            tokio::time::sleep(render_after).await;
            let ok = signals.render_complete();
            lock(&state).delivered.push((signals.cycle_id(), "render", ok));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn power_link_follows_radio() {
        let power = MockPower::connects_after(1);
        assert!(!power.is_connected().await.unwrap());
        power.set_radio_enabled(true).await.unwrap();
        assert!(!power.is_connected().await.unwrap());
        assert!(power.is_connected().await.unwrap());
        power.set_radio_enabled(false).await.unwrap();
        assert!(!power.is_connected().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn power_faults_leave_state_alone() {
        let power = MockPower::offline().with_fault(MockFault::Radio);
        assert!(power.set_radio_enabled(true).await.is_err());
        assert!(!power.radio_on());
        assert_eq!(power.count(|c| *c == PowerCall::SetRadio(true)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_tracks_tokio_time() {
        let clock = MockClock::at(10_000);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(clock.now_ms(), 11_500);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 12_000);
    }

    #[tokio::test]
    async fn http_last_reply_repeats() {
        let http = MockHttp::new()
            .route("/a", HttpResponse::error(500, "x"))
            .route("/a", HttpResponse::ok("y"));
        assert_eq!(http.get(HttpRequest::get("http://h/a")).await.unwrap().status, 500);
        assert_eq!(http.get(HttpRequest::get("http://h/a")).await.unwrap().status, 200);
        assert_eq!(http.get(HttpRequest::get("http://h/a")).await.unwrap().status, 200);
        assert_eq!(http.get(HttpRequest::get("http://h/b")).await.unwrap().status, 404);
        assert_eq!(http.requests_to("/a").len(), 3);
    }

    #[test]
    fn alarm_tracks_latest() {
        let alarm = MockAlarm::new();
        alarm.arm(5).unwrap();
        alarm.disarm().unwrap();
        assert_eq!(alarm.armed(), None);
        alarm.set_failing(true);
        assert!(alarm.arm(6).is_err());
        assert_eq!(alarm.events(), vec![AlarmEvent::Armed(5), AlarmEvent::Disarmed]);
    }
}
