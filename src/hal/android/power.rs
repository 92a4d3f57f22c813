//! Radio, power-enhance toggle and kernel wake lock.
//!
//! The power-enhance toggle is the `power_enhance_enable` system setting.
//! The Nook's panel driver watches it: `1` lets the device drop into its
//! deep e-ink sleep, `0` keeps it interactive.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;

use super::{paths, read_trimmed, run};
use crate::error::PlatformError;
use crate::traits::PowerPlatform;

const POWER_ENHANCE_KEY: &str = "power_enhance_enable";
const WAKE_LOCK_NAME: &str = "nook_trmnl";

/// [`PowerPlatform`] for a rooted Nook.
#[derive(Debug)]
pub struct AndroidPower {
    interface: String,
    route_table: PathBuf,
    wake_lock: PathBuf,
    wake_unlock: PathBuf,
    held: AtomicBool,
}

impl Default for AndroidPower {
    fn default() -> Self {
        Self::new(paths::WIFI_INTERFACE)
    }
}

impl AndroidPower {
    /// Platform watching `interface` for connectivity.
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            route_table: PathBuf::from(paths::ROUTE_TABLE),
            wake_lock: PathBuf::from(paths::WAKE_LOCK),
            wake_unlock: PathBuf::from(paths::WAKE_UNLOCK),
            held: AtomicBool::new(false),
        }
    }

    fn operstate_path(&self) -> PathBuf {
        PathBuf::from(format!("/sys/class/net/{}/operstate", self.interface))
    }
}

impl PowerPlatform for AndroidPower {
    type Error = PlatformError;

    async fn is_connected(&self) -> Result<bool, PlatformError> {
        let state = match read_trimmed(&self.operstate_path()).await {
            Ok(state) => state,
            // interface not created yet while the radio comes up
            Err(PlatformError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(false)
            }
            Err(e) => return Err(e),
        };
        if state != "up" {
            return Ok(false);
        }
        let routes = read_trimmed(&self.route_table).await?;
        Ok(has_default_route(&routes, &self.interface))
    }

    async fn radio_enabled(&self) -> Result<bool, PlatformError> {
        let value = run("settings", &["get", "global", "wifi_on"]).await?;
        Ok(super::parse_setting(&value)? != 0)
    }

    async fn set_radio_enabled(&self, enabled: bool) -> Result<(), PlatformError> {
        let action = if enabled { "enable" } else { "disable" };
        run("svc", &["wifi", action]).await.map(drop)
    }

    async fn power_enhance(&self) -> Result<i32, PlatformError> {
        let value = run("settings", &["get", "system", POWER_ENHANCE_KEY]).await?;
        super::parse_setting(&value)
    }

    async fn set_power_enhance(&self, value: i32) -> Result<(), PlatformError> {
        let value = value.to_string();
        run("settings", &["put", "system", POWER_ENHANCE_KEY, &value])
            .await
            .map(drop)
    }

    async fn acquire_wake_hold(&self, ceiling: Duration) -> Result<(), PlatformError> {
        let request = format!("{WAKE_LOCK_NAME} {}", ceiling.as_nanos());
        tokio::fs::write(&self.wake_lock, request).await?;
        self.held.store(true, Ordering::SeqCst);
        debug!("wake lock {WAKE_LOCK_NAME} held for at most {}s", ceiling.as_secs());
        Ok(())
    }

    async fn release_wake_hold(&self) -> Result<(), PlatformError> {
        // the kernel drops it at the timeout anyway
        self.held.store(false, Ordering::SeqCst);
        tokio::fs::write(&self.wake_unlock, WAKE_LOCK_NAME).await?;
        Ok(())
    }

    fn wake_hold_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// Returns true if `/proc/net/route` content has a default route via `interface`.
fn has_default_route(table: &str, interface: &str) -> bool {
    table.lines().skip(1).any(|line| {
        let mut fields = line.split_whitespace();
        fields.next() == Some(interface) && fields.next() == Some("00000000")
    })
}
