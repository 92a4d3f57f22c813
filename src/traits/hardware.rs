//! Platform abstraction traits for power, battery, wake alarm and time.
//!
//! These traits let the update cycle run unchanged on a rooted e-reader and
//! on a desktop test harness.
//!
//! # Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`PowerPlatform`] | Radio, connectivity, power-enhance toggle, wake hold |
//! | [`BatteryMonitor`] | Battery percentage for the display request |
//! | [`WakeAlarm`] | Exact-time one-shot hardware wake (RTC alarm) |
//! | [`Clock`] | Wall-clock time in epoch milliseconds |
//!
//! # Implementation
//!
//! For testing and desktop development, use the mock implementations
//! from [`crate::hal::mock`]. For the device, use `hal::android`
//! (requires the `android` feature).
//!
//! # Example
//!
//! ```rust
//! use nook_trmnl::traits::Clock;
//! use nook_trmnl::hal::MockClock;
//!
//! let clock = MockClock::at(1_000);
//! assert_eq!(clock.now_ms(), 1_000);
//! ```

use core::fmt::{Debug, Display};
use core::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Device power primitives used by [`PowerController`](crate::power::PowerController).
///
/// Every method is a single platform call. Implementations must not retry
/// internally; the controller decides what to do with a failure.
///
/// # Implementation Notes
///
/// - `is_connected` should report a usable link (interface up with a route),
///   not merely an enabled radio
/// - `set_power_enhance(1)` puts the panel controller into its low-power mode,
///   `0` takes it out
/// - The wake hold must expire on its own after `ceiling` even if
///   `release_wake_hold` is never called
pub trait PowerPlatform: Send + Sync {
    /// Error type for platform calls.
    type Error: Debug + Display + Send;

    /// Returns true if the device currently has network connectivity.
    fn is_connected(&self) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Returns true if the wireless radio is switched on.
    fn radio_enabled(&self) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Switch the wireless radio on or off.
    fn set_radio_enabled(
        &self,
        enabled: bool,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Read the power-enhance toggle.
    fn power_enhance(&self) -> impl Future<Output = Result<i32, Self::Error>> + Send;

    /// Write the power-enhance toggle.
    fn set_power_enhance(&self, value: i32)
        -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Take the exclusive wake hold, auto-expiring after `ceiling`.
    fn acquire_wake_hold(
        &self,
        ceiling: Duration,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Drop the wake hold if it is held.
    fn release_wake_hold(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Returns true while this process holds the wake hold.
    fn wake_hold_held(&self) -> bool;
}

/// Battery level source.
pub trait BatteryMonitor: Send + Sync {
    /// Battery charge in percent, or `None` when the platform cannot tell.
    fn battery_level(&self) -> impl Future<Output = Option<u8>> + Send;
}

/// Exact-time hardware wake.
///
/// Only one alarm exists at a time; arming replaces whatever was armed
/// before. This is the durable half of the
/// [`Scheduler`](crate::scheduler::Scheduler): it survives the CPU
/// suspending, while the scheduler's in-process timer does not.
pub trait WakeAlarm: Send + Sync {
    /// Error type for alarm operations.
    type Error: Debug + Display + Send;

    /// Arm the alarm for `at_ms` (epoch milliseconds), replacing any armed alarm.
    fn arm(&self, at_ms: u64) -> Result<(), Self::Error>;

    /// Clear the armed alarm, if any.
    fn disarm(&self) -> Result<(), Self::Error>;
}

/// Wall-clock time source.
///
/// Scheduled wakes are absolute epoch timestamps so they can be persisted
/// and handed to the RTC, which is why this is wall time rather than a
/// monotonic counter.
pub trait Clock: Send + Sync {
    /// Returns milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// [`Clock`] backed by [`SystemTime`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}
