//! Battery level and headset jack.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::{paths, read_trimmed};
use crate::scheduler::{Scheduler, TriggerSource};
use crate::traits::{BatteryMonitor, WakeAlarm};

/// [`BatteryMonitor`] reading the power-supply class.
#[derive(Debug, Clone)]
pub struct SysfsBattery {
    path: PathBuf,
}

impl Default for SysfsBattery {
    fn default() -> Self {
        Self::new(paths::BATTERY_CAPACITY)
    }
}

impl SysfsBattery {
    /// Battery at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BatteryMonitor for SysfsBattery {
    async fn battery_level(&self) -> Option<u8> {
        match read_trimmed(&self.path).await {
            Ok(text) => text.parse::<u8>().ok().map(|level| level.min(100)),
            Err(e) => {
                warn!("could not read battery level: {e}");
                None
            }
        }
    }
}

/// Watches the headset switch and fires the primary trigger on insertion.
///
/// Plugging something into the jack is the Nook's interactive wake path.
#[derive(Debug, Clone)]
pub struct HeadsetMonitor {
    path: PathBuf,
    interval: Duration,
}

impl Default for HeadsetMonitor {
    fn default() -> Self {
        Self::new(paths::HEADSET_STATE, Duration::from_millis(500))
    }
}

impl HeadsetMonitor {
    /// Poll `path` every `interval`.
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }

    /// Poll forever, calling [`Scheduler::trigger_now`] on each `0 -> 1` edge.
    pub async fn run<A: WakeAlarm>(self, scheduler: Arc<Scheduler<A>>) {
        let mut previous = self.read().await;
        loop {
            tokio::time::sleep(self.interval).await;
            let state = self.read().await;
            if state != previous {
                debug!("headset state changed: {previous:?} -> {state:?}");
                if state == Some(1) && previous != Some(1) {
                    info!("headset connected, waking for update");
                    scheduler.trigger_now(TriggerSource::HeadphonePrimary);
                }
                previous = state;
            }
        }
    }

    async fn read(&self) -> Option<u8> {
        read_trimmed(&self.path).await.ok()?.parse().ok()
    }
}
