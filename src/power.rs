//! Device wake/sleep primitives.
//!
//! [`PowerController`] wraps a [`PowerPlatform`] with the sequencing the
//! e-reader needs:
//!
//! ```text
//! wake:   take wake hold -> power_enhance = 0 -> settle
//! sleep:  radio off -> release hold -> power_enhance 0 -> 1 (pulse) -> read back
//! ```
//!
//! Every sub-step is fault-isolated. A failing step is logged and reported
//! in the returned [`PowerError`], but the remaining steps still run, so the
//! radio is always switched off and the wake hold always released.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::sleep;

use crate::config::PowerConfig;
use crate::error::{PowerError, StepFailure};
use crate::traits::PowerPlatform;

/// Step names used in [`PowerError`] and logs.
pub mod steps {
    /// Taking the wake hold.
    pub const ACQUIRE_WAKE_HOLD: &str = "acquire wake hold";
    /// Clearing the low-power toggle on wake.
    pub const CLEAR_POWER_ENHANCE: &str = "clear power enhance";
    /// Switching the radio off.
    pub const DISABLE_RADIO: &str = "disable radio";
    /// Dropping the wake hold.
    pub const RELEASE_WAKE_HOLD: &str = "release wake hold";
    /// Either edge of the sleep pulse.
    pub const PULSE_POWER_ENHANCE: &str = "pulse power enhance";
}

/// Wake/sleep sequencing over a [`PowerPlatform`].
#[derive(Debug)]
pub struct PowerController<P> {
    platform: P,
    config: PowerConfig,
}

impl<P: PowerPlatform> PowerController<P> {
    /// Create a controller with the given timings.
    pub fn new(platform: P, config: PowerConfig) -> Self {
        Self { platform, config }
    }

    /// The underlying platform.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Timings in use.
    pub fn config(&self) -> &PowerConfig {
        &self.config
    }

    /// Make sure the device is online.
    ///
    /// Returns `true` at once if already connected. Otherwise switches the
    /// radio on and polls up to `max_attempts` times, `interval` apart. On
    /// success it waits one stabilization period before returning, so a
    /// half-negotiated link is not reported as usable. Returns `false` when
    /// the attempts run out; platform errors count as "not connected".
    pub async fn ensure_connectivity(&self, max_attempts: u32, interval: Duration) -> bool {
        if self.connected().await {
            debug!("already connected");
            return true;
        }

        match self.platform.radio_enabled().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("radio is off, enabling");
                self.enable_radio().await;
            }
            Err(e) => {
                warn!("could not read radio state ({e}), enabling anyway");
                self.enable_radio().await;
            }
        }

        for attempt in 0..max_attempts {
            if self.connected().await {
                info!(
                    "network connected after {}ms",
                    interval.as_millis() * attempt as u128
                );
                sleep(Duration::from_millis(self.config.stabilize_ms)).await;
                return true;
            }
            sleep(interval).await;
            debug!("waiting for network... attempt {}", attempt + 1);
        }

        warn!("no network after {max_attempts} polls");
        false
    }

    /// [`ensure_connectivity`](Self::ensure_connectivity) with the configured polling.
    pub async fn connect(&self) -> bool {
        self.ensure_connectivity(self.config.poll_attempts, self.config.poll_interval())
            .await
    }

    /// Bring the device out of low-power mode.
    pub async fn wake(&self) -> Result<(), PowerError> {
        let mut failures = Vec::new();

        let ceiling = Duration::from_millis(self.config.wake_hold_ceiling_ms);
        if let Err(e) = self.platform.acquire_wake_hold(ceiling).await {
            record(&mut failures, steps::ACQUIRE_WAKE_HOLD, e);
        }

        let before = self.power_state().await;
        if let Err(e) = self.platform.set_power_enhance(0).await {
            record(&mut failures, steps::CLEAR_POWER_ENHANCE, e);
        }
        let after = self.power_state().await;
        info!("wake: power_enhance changed from {} to {}", show(before), show(after));

        sleep(Duration::from_millis(self.config.wake_settle_ms)).await;
        debug!("power_enhance after settle: {}", show(self.power_state().await));

        finish(failures)
    }

    /// Put the device back into low-power mode.
    ///
    /// Radio off, wake hold released, then the power-enhance toggle pulsed
    /// `0 -> 1`. The panel driver reacts to the edge, not the level, so the
    /// `0` is written even when the toggle already reads `0`.
    pub async fn sleep(&self) -> Result<(), PowerError> {
        let mut failures = Vec::new();

        let radio_on = match self.platform.radio_enabled().await {
            Ok(on) => on,
            Err(e) => {
                warn!("could not read radio state ({e}), disabling anyway");
                true
            }
        };
        if radio_on {
            debug!("disabling radio for sleep");
            if let Err(e) = self.platform.set_radio_enabled(false).await {
                record(&mut failures, steps::DISABLE_RADIO, e);
            }
        }

        if self.platform.wake_hold_held() {
            match self.platform.release_wake_hold().await {
                Ok(()) => debug!("wake hold released"),
                Err(e) => record(&mut failures, steps::RELEASE_WAKE_HOLD, e),
            }
        }

        if let Err(e) = self.platform.set_power_enhance(0).await {
            record(&mut failures, steps::PULSE_POWER_ENHANCE, e);
        }
        sleep(Duration::from_millis(self.config.toggle_settle_ms)).await;
        if let Err(e) = self.platform.set_power_enhance(1).await {
            record(&mut failures, steps::PULSE_POWER_ENHANCE, e);
        }
        debug!("sleep command sent, checking state");

        sleep(Duration::from_millis(self.config.sleep_check_ms)).await;
        info!("sleep: power_enhance now {}", show(self.power_state().await));

        finish(failures)
    }

    /// Current power-enhance value, logging (not returning) read errors.
    pub async fn power_state(&self) -> Option<i32> {
        match self.platform.power_enhance().await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("could not read power_enhance: {e}");
                None
            }
        }
    }

    async fn connected(&self) -> bool {
        match self.platform.is_connected().await {
            Ok(up) => up,
            Err(e) => {
                warn!("connectivity check failed: {e}");
                false
            }
        }
    }

    async fn enable_radio(&self) {
        if let Err(e) = self.platform.set_radio_enabled(true).await {
            warn!("could not enable radio: {e}");
        }
    }
}

fn record(failures: &mut Vec<StepFailure>, step: &'static str, err: impl std::fmt::Display) {
    warn!("{step} failed: {err}");
    failures.push(StepFailure {
        step,
        message: err.to_string(),
    });
}

fn finish(failures: Vec<StepFailure>) -> Result<(), PowerError> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(PowerError { failures })
    }
}

fn show(value: Option<i32>) -> String {
    value.map_or_else(|| "?".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{MockFault, MockPower, PowerCall};
    use tokio::time::Instant;

    fn controller(platform: MockPower) -> PowerController<MockPower> {
        PowerController::new(platform, PowerConfig::default())
    }

    // =========================================================================
    // ensure_connectivity
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn already_connected_returns_immediately() {
        let power = controller(MockPower::connected());
        let start = Instant::now();
        assert!(power.ensure_connectivity(30, Duration::from_millis(500)).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(power.platform().count(|c| matches!(c, PowerCall::SetRadio(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn enables_radio_and_stabilizes() {
        let power = controller(MockPower::connects_after(3));
        let start = Instant::now();
        assert!(power.ensure_connectivity(30, Duration::from_millis(500)).await);
        // 3 failed polls, then 1s stabilization
        assert_eq!(start.elapsed(), Duration::from_millis(3 * 500 + 1_000));
        assert!(power.platform().radio_on());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let power = controller(MockPower::offline());
        let start = Instant::now();
        assert!(!power.ensure_connectivity(4, Duration::from_millis(500)).await);
        assert_eq!(start.elapsed(), Duration::from_millis(2_000));
        // initial check plus one per attempt
        assert_eq!(power.platform().count(|c| *c == PowerCall::IsConnected), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_errors_count_as_offline() {
        let power = controller(MockPower::connected().with_fault(MockFault::Connectivity));
        assert!(!power.ensure_connectivity(2, Duration::from_millis(100)).await);

        power.platform().clear_fault(MockFault::Connectivity);
        let start = Instant::now();
        assert!(power.ensure_connectivity(2, Duration::from_millis(100)).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn link_that_comes_up_later_is_picked_up() {
        let power = controller(MockPower::offline());
        assert!(!power.ensure_connectivity(2, Duration::from_millis(500)).await);
        assert!(power.platform().radio_on());

        power.platform().set_connect_after(Some(1));
        let start = Instant::now();
        assert!(power.ensure_connectivity(2, Duration::from_millis(500)).await);
        // radio already on: the first check fails, the next one connects
        assert_eq!(start.elapsed(), Duration::from_millis(1_000));
        assert_eq!(power.platform().count(|c| *c == PowerCall::SetRadio(true)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stabilization_and_hold_ceiling_are_configurable() {
        let config = PowerConfig::default()
            .with_stabilize_ms(250)
            .with_wake_hold_ceiling_ms(60_000);
        let power = PowerController::new(MockPower::connects_after(2), config);

        power.wake().await.unwrap();
        assert!(power
            .platform()
            .calls()
            .iter()
            .any(|(_, c)| *c == PowerCall::AcquireHold(Duration::from_secs(60))));

        let start = Instant::now();
        assert!(power.ensure_connectivity(30, Duration::from_millis(500)).await);
        assert_eq!(start.elapsed(), Duration::from_millis(2 * 500 + 250));
    }

    // =========================================================================
    // wake / sleep
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn wake_takes_hold_and_clears_toggle() {
        let power = controller(MockPower::offline());
        let start = Instant::now();
        power.wake().await.unwrap();

        assert!(power.platform().hold_held());
        assert_eq!(power.platform().toggle(), 0);
        assert_eq!(start.elapsed(), Duration::from_millis(400));
        assert!(power
            .platform()
            .calls()
            .iter()
            .any(|(_, c)| *c == PowerCall::AcquireHold(Duration::from_secs(600))));
    }

    #[tokio::test(start_paused = true)]
    async fn wake_continues_past_hold_failure() {
        let power = controller(MockPower::offline().with_fault(MockFault::WakeHold));
        let err = power.wake().await.unwrap_err();
        assert!(err.failed(steps::ACQUIRE_WAKE_HOLD));
        assert_eq!(power.platform().toggle(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_pulses_toggle_after_radio_and_hold() {
        let power = controller(MockPower::connected());
        power.wake().await.unwrap();
        power.platform().clear_calls();

        let start = Instant::now();
        power.sleep().await.unwrap();

        let calls: Vec<PowerCall> = power.platform().calls().into_iter().map(|(_, c)| c).collect();
        let writes: Vec<&PowerCall> = calls
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    PowerCall::SetRadio(_) | PowerCall::ReleaseHold | PowerCall::SetToggle(_)
                )
            })
            .collect();
        assert_eq!(
            writes,
            vec![
                &PowerCall::SetRadio(false),
                &PowerCall::ReleaseHold,
                &PowerCall::SetToggle(0),
                &PowerCall::SetToggle(1),
            ]
        );
        assert_eq!(start.elapsed(), Duration::from_millis(250));
        assert!(!power.platform().radio_on());
        assert!(!power.platform().hold_held());
        assert_eq!(power.platform().toggle(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_isolates_every_failure() {
        let platform = MockPower::connected()
            .with_fault(MockFault::Radio)
            .with_fault(MockFault::Toggle);
        let power = controller(platform);
        let _ = power.wake().await;

        let err = power.sleep().await.unwrap_err();
        assert!(err.failed(steps::DISABLE_RADIO));
        assert!(err.failed(steps::PULSE_POWER_ENHANCE));
        // the hold is still released even though everything around it failed
        assert!(!power.platform().hold_held());
        assert_eq!(power.platform().sleep_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_skips_radio_when_already_off() {
        let power = controller(MockPower::offline());
        power.sleep().await.unwrap();
        assert_eq!(power.platform().count(|c| matches!(c, PowerCall::SetRadio(_))), 0);
        assert_eq!(power.platform().count(|c| *c == PowerCall::ReleaseHold), 0);
    }
}
