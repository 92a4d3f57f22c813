//! RTC wake alarm.

use std::fs;
use std::path::PathBuf;

use log::debug;

use super::paths;
use crate::error::PlatformError;
use crate::traits::WakeAlarm;

/// [`WakeAlarm`] on the RTC's `wakealarm` attribute.
///
/// The kernel refuses to overwrite an armed alarm, so arming always clears
/// it first.
///
/// Writes are synchronous. `wakealarm` is a sysfs attribute: a write is a
/// call into the RTC driver that returns without touching storage, so it is
/// done inline on the async caller rather than through `block_in_place`,
/// which would also rule out the single-threaded runtime.
#[derive(Debug, Clone)]
pub struct RtcAlarm {
    path: PathBuf,
}

impl Default for RtcAlarm {
    fn default() -> Self {
        Self::new(paths::RTC_WAKEALARM)
    }
}

impl RtcAlarm {
    /// Alarm at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl WakeAlarm for RtcAlarm {
    type Error = PlatformError;

    fn arm(&self, at_ms: u64) -> Result<(), PlatformError> {
        let secs = at_ms.div_ceil(1_000);
        fs::write(&self.path, "0")?;
        fs::write(&self.path, secs.to_string())?;
        debug!("rtc wake alarm armed for {secs}");
        Ok(())
    }

    fn disarm(&self) -> Result<(), PlatformError> {
        fs::write(&self.path, "0")?;
        Ok(())
    }
}
