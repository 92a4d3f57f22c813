//! Rooted e-reader hardware abstraction layer.
//!
//! Everything here talks to the stock Android userland of a rooted Nook
//! (running as root): the `svc` and `settings` tools, sysfs and procfs.
//!
//! | Type | Trait | Backed by |
//! |------|-------|-----------|
//! | [`AndroidPower`] | [`PowerPlatform`](crate::traits::PowerPlatform) | `svc wifi`, `settings`, `/sys/power/wake_lock` |
//! | [`SysfsBattery`] | [`BatteryMonitor`](crate::traits::BatteryMonitor) | `/sys/class/power_supply/battery/capacity` |
//! | [`RtcAlarm`] | [`WakeAlarm`](crate::traits::WakeAlarm) | `/sys/class/rtc/rtc0/wakealarm` |
//! | [`FileDisplay`] | [`DisplaySink`](crate::traits::DisplaySink) | Image file picked up by the viewer, `wm size` |
//! | [`HeadsetMonitor`] | - | `/sys/class/switch/h2w/state` |
//!
//! # Paths
//!
//! See the [`paths`] module for the default locations.

mod alarm;
mod display;
mod power;
mod sensors;

pub use alarm::RtcAlarm;
pub use display::FileDisplay;
pub use power::AndroidPower;
pub use sensors::{HeadsetMonitor, SysfsBattery};

use std::path::Path;

use log::debug;
use tokio::process::Command;

use crate::error::PlatformError;

/// Default device paths.
pub mod paths {
    // =========================================================================
    // Power
    // =========================================================================

    /// Kernel wake lock acquire file; accepts `name [timeout_ns]`.
    pub const WAKE_LOCK: &str = "/sys/power/wake_lock";

    /// Kernel wake lock release file.
    pub const WAKE_UNLOCK: &str = "/sys/power/wake_unlock";

    /// RTC wake alarm, epoch seconds (`0` clears).
    pub const RTC_WAKEALARM: &str = "/sys/class/rtc/rtc0/wakealarm";

    // =========================================================================
    // Sensors
    // =========================================================================

    /// Battery charge in percent.
    pub const BATTERY_CAPACITY: &str = "/sys/class/power_supply/battery/capacity";

    /// Headset jack switch, `1` when something is plugged in.
    pub const HEADSET_STATE: &str = "/sys/class/switch/h2w/state";

    // =========================================================================
    // Network
    // =========================================================================

    /// Wireless interface name.
    pub const WIFI_INTERFACE: &str = "wlan0";

    /// Kernel routing table.
    pub const ROUTE_TABLE: &str = "/proc/net/route";
}

/// Run `program args...`, returning trimmed stdout.
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<String, PlatformError> {
    let output = Command::new(program).args(args).output().await?;
    let command = || format!("{program} {}", args.join(" "));
    if !output.status.success() {
        return Err(PlatformError::Command {
            command: command(),
            status: output.status.code().unwrap_or(-1),
        });
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!("`{}` -> {stdout}", command());
    Ok(stdout)
}

/// Read a sysfs/procfs file, trimmed.
pub(crate) async fn read_trimmed(path: &Path) -> Result<String, PlatformError> {
    Ok(tokio::fs::read_to_string(path).await?.trim().to_string())
}

/// Parse an integer setting as printed by `settings get`.
///
/// An unset key prints `null`, which reads as `0`.
pub(crate) fn parse_setting(text: &str) -> Result<i32, PlatformError> {
    match text.trim() {
        "" | "null" => Ok(0),
        value => value
            .parse()
            .map_err(|_| PlatformError::Unexpected(format!("setting value {value:?}"))),
    }
}
