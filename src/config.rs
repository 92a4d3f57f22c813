//! Configuration and persisted device state.
//!
//! [`Config`] is the operator-facing configuration (server, credentials,
//! timings). [`DeviceState`] is what the daemon learns at runtime and must
//! remember across restarts (last registration, negotiated refresh rate,
//! next wake). Both are stored together as [`Settings`] behind a
//! [`ConfigStore`].
//!
//! Strings use `heapless::String`. Builders truncate oversized values; a
//! stored document with an oversized value fails to load.
//!
//! # Example
//!
//! ```rust
//! use nook_trmnl::config::{Config, CycleConfig, ServerConfig};
//!
//! // Use defaults
//! let config = Config::default();
//! assert_eq!(config.server.base_url.as_str(), "https://trmnl.app");
//!
//! // Or customize
//! let config = Config::default()
//!     .with_server(ServerConfig::default().with_base_url("http://192.168.1.10:2300"))
//!     .with_cycle(CycleConfig::default().with_retry_interval_secs(120));
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use heapless::String as HString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Maximum length for short config strings (device id, user agent)
pub const MAX_SHORT_STRING: usize = 64;

/// Maximum length for longer config strings (URLs, tokens)
pub const MAX_LONG_STRING: usize = 128;

/// Type alias for short config strings
pub type ShortString = HString<MAX_SHORT_STRING>;

/// Type alias for longer config strings
pub type LongString = HString<MAX_LONG_STRING>;

// ============================================================================
// Helpers for creating heapless strings
// ============================================================================

fn bounded<const N: usize>(s: &str) -> HString<N> {
    let mut end = s.len().min(N);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut hs = HString::new();
    // Cannot fail: `end <= N`.
    let _ = hs.push_str(&s[..end]);
    hs
}

/// Create a ShortString from a &str, truncating if too long
pub fn short_string(s: &str) -> ShortString {
    bounded(s)
}

/// Create a LongString from a &str, truncating if too long
pub fn long_string(s: &str) -> LongString {
    bounded(s)
}

// ============================================================================
// Main Config
// ============================================================================

/// Complete application configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Display server endpoint
    pub server: ServerConfig,
    /// Device identity and credentials
    pub device: DeviceConfig,
    /// Panel and debug overlay
    pub display: DisplayConfig,
    /// Update cycle timeouts and retry policy
    pub cycle: CycleConfig,
    /// Power controller timings
    pub power: PowerConfig,
    /// In-process wake timer
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Set server configuration
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    /// Set device configuration
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    /// Set display configuration
    pub fn with_display(mut self, display: DisplayConfig) -> Self {
        self.display = display;
        self
    }

    /// Set cycle configuration
    pub fn with_cycle(mut self, cycle: CycleConfig) -> Self {
        self.cycle = cycle;
        self
    }

    /// Set power configuration
    pub fn with_power(mut self, power: PowerConfig) -> Self {
        self.power = power;
        self
    }

    /// Set scheduler configuration
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }
}

// ============================================================================
// Server Config
// ============================================================================

/// Display server endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL without trailing slash
    pub base_url: LongString,
    /// `User-Agent` sent with display requests
    pub user_agent: ShortString,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: long_string("https://trmnl.app"),
            user_agent: short_string("trmnl-display/1.5.11"),
        }
    }
}

impl ServerConfig {
    /// Set the base URL (a trailing slash is dropped)
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = long_string(url.trim_end_matches('/'));
        self
    }

    /// Set the user agent
    pub fn with_user_agent(mut self, agent: &str) -> Self {
        self.user_agent = short_string(agent);
        self
    }

    /// Join `path` onto the base URL
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

// ============================================================================
// Device Config
// ============================================================================

/// Device identity and credentials
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device identifier (MAC address), sent as `ID`
    pub id: ShortString,
    /// API key, sent as `Access-Token`
    pub access_token: LongString,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: short_string("your-mac-address"),
            access_token: long_string("your-api-key"),
        }
    }
}

impl DeviceConfig {
    /// Set the device identifier
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = short_string(id);
        self
    }

    /// Set the access token
    pub fn with_access_token(mut self, token: &str) -> Self {
        self.access_token = long_string(token);
        self
    }
}

// ============================================================================
// Display Config
// ============================================================================

/// Panel and debug overlay
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Paint the developer status block with every frame
    pub show_debug_info: bool,
    /// Cached panel width in pixels (0 = unknown)
    pub width: u32,
    /// Cached panel height in pixels (0 = unknown)
    pub height: u32,
}

impl DisplayConfig {
    /// Enable or disable the debug status block
    pub fn with_debug_info(mut self, enabled: bool) -> Self {
        self.show_debug_info = enabled;
        self
    }

    /// Set the cached panel size
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Cached size, if both dimensions are known
    pub fn size(&self) -> Option<(u32, u32)> {
        (self.width > 0 && self.height > 0).then_some((self.width, self.height))
    }
}

// ============================================================================
// Cycle Config
// ============================================================================

/// Update cycle timeouts and retry policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// How long to wait for the network-complete signal
    pub network_timeout_ms: u64,
    /// How long to wait for the render-complete signal
    pub render_timeout_ms: u64,
    /// Connectivity rounds before giving up on the cycle
    pub connect_attempts: u32,
    /// Backoff unit between connectivity rounds (multiplied by the attempt
    /// number); no backoff follows the last round
    pub connect_backoff_ms: u64,
    /// Registration + fetch attempts inside the surface
    pub fetch_attempts: u32,
    /// Fixed delay between fetch attempts
    pub fetch_backoff_ms: u64,
    /// Delay before retrying a failed cycle
    pub retry_interval_secs: u32,
    /// Refresh rate used before the server ever reported one
    pub default_refresh_secs: u32,
    /// Re-register once the last registration is this old
    pub registration_staleness_secs: u64,
    /// Treat alarm triggers as no-ops and wait for the primary trigger
    pub defer_alarm_to_primary: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            network_timeout_ms: 30_000,
            render_timeout_ms: 15_000,
            connect_attempts: 3,
            connect_backoff_ms: 2_000,
            fetch_attempts: 3,
            fetch_backoff_ms: 1_000,
            retry_interval_secs: 30,
            default_refresh_secs: 60,
            registration_staleness_secs: 7 * 24 * 60 * 60,
            defer_alarm_to_primary: false,
        }
    }
}

impl CycleConfig {
    /// Set the network-complete timeout
    pub fn with_network_timeout_ms(mut self, ms: u64) -> Self {
        self.network_timeout_ms = ms;
        self
    }

    /// Set the render-complete timeout
    pub fn with_render_timeout_ms(mut self, ms: u64) -> Self {
        self.render_timeout_ms = ms;
        self
    }

    /// Set connectivity attempts and backoff unit
    pub fn with_connect_policy(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.connect_attempts = attempts;
        self.connect_backoff_ms = backoff_ms;
        self
    }

    /// Set fetch attempts and fixed backoff
    pub fn with_fetch_policy(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.fetch_attempts = attempts;
        self.fetch_backoff_ms = backoff_ms;
        self
    }

    /// Set the failed-cycle retry interval
    pub fn with_retry_interval_secs(mut self, secs: u32) -> Self {
        self.retry_interval_secs = secs;
        self
    }

    /// Set the initial refresh rate
    pub fn with_default_refresh_secs(mut self, secs: u32) -> Self {
        self.default_refresh_secs = secs;
        self
    }

    /// Set the registration staleness window
    pub fn with_registration_staleness_secs(mut self, secs: u64) -> Self {
        self.registration_staleness_secs = secs;
        self
    }

    /// Make alarm triggers defer to the primary trigger
    pub fn with_defer_alarm_to_primary(mut self, defer: bool) -> Self {
        self.defer_alarm_to_primary = defer;
        self
    }

    /// Network-complete timeout as a [`Duration`]
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    /// Render-complete timeout as a [`Duration`]
    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }

    /// Backoff after the given (1-based) failed connectivity attempt
    pub fn connect_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.connect_backoff_ms.saturating_mul(attempt as u64))
    }
}

// ============================================================================
// Power Config
// ============================================================================

/// Power controller timings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Interval between connectivity polls
    pub poll_interval_ms: u64,
    /// Connectivity polls per `ensure_connectivity` call
    pub poll_attempts: u32,
    /// Extra wait after the link comes up
    pub stabilize_ms: u64,
    /// Settle time after leaving low-power mode
    pub wake_settle_ms: u64,
    /// Delay between the two phases of the sleep pulse
    pub toggle_settle_ms: u64,
    /// Delay before reading back the toggle after sleeping
    pub sleep_check_ms: u64,
    /// Wake hold auto-expiry
    pub wake_hold_ceiling_ms: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            poll_attempts: 30,
            stabilize_ms: 1_000,
            wake_settle_ms: 400,
            toggle_settle_ms: 200,
            sleep_check_ms: 50,
            wake_hold_ceiling_ms: 10 * 60 * 1_000,
        }
    }
}

impl PowerConfig {
    /// Set connectivity polling
    pub fn with_polling(mut self, interval_ms: u64, attempts: u32) -> Self {
        self.poll_interval_ms = interval_ms;
        self.poll_attempts = attempts;
        self
    }

    /// Set the post-connect stabilization wait
    pub fn with_stabilize_ms(mut self, ms: u64) -> Self {
        self.stabilize_ms = ms;
        self
    }

    /// Set the wake hold ceiling
    pub fn with_wake_hold_ceiling_ms(mut self, ms: u64) -> Self {
        self.wake_hold_ceiling_ms = ms;
        self
    }

    /// Poll interval as a [`Duration`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ============================================================================
// Scheduler Config
// ============================================================================

/// In-process wake timer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on a single timer sleep, so wall-clock jumps
    /// (suspend, NTP) are noticed promptly
    pub recheck_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { recheck_ms: 5_000 }
    }
}

impl SchedulerConfig {
    /// Set the recheck interval
    pub fn with_recheck_ms(mut self, ms: u64) -> Self {
        self.recheck_ms = ms;
        self
    }
}

// ============================================================================
// Persisted State
// ============================================================================

/// Runtime state remembered across restarts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceState {
    /// Epoch ms of the last successful registration
    pub last_registration_ms: Option<u64>,
    /// Last refresh rate reported by the server
    pub refresh_rate_secs: u32,
    /// Epoch ms of the pending wake
    pub next_wake_at_ms: Option<u64>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            last_registration_ms: None,
            refresh_rate_secs: CycleConfig::default().default_refresh_secs,
            next_wake_at_ms: None,
        }
    }
}

/// Everything a [`ConfigStore`] holds
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Operator configuration
    pub config: Config,
    /// Learned runtime state
    pub state: DeviceState,
}

impl Settings {
    /// Start from a configuration, seeding the refresh rate from it
    pub fn from_config(config: Config) -> Self {
        let state = DeviceState {
            refresh_rate_secs: config.cycle.default_refresh_secs,
            ..DeviceState::default()
        };
        Self { config, state }
    }
}

// ============================================================================
// Stores
// ============================================================================

/// Persistent home for [`Settings`].
///
/// Reads are snapshotted by the caller; writes go through [`update`](Self::update).
pub trait ConfigStore: Send + Sync {
    /// Load the current settings.
    fn load(&self) -> Result<Settings, ConfigError>;

    /// Apply `change` to the stored settings.
    fn update(&self, change: &mut dyn FnMut(&mut Settings)) -> Result<(), ConfigError>;

    /// Remember a successful registration.
    fn record_registration(&self, at_ms: u64) -> Result<(), ConfigError> {
        self.update(&mut |s| s.state.last_registration_ms = Some(at_ms))
    }

    /// Remember the refresh rate reported by the server.
    fn record_refresh_rate(&self, secs: u32) -> Result<(), ConfigError> {
        self.update(&mut |s| s.state.refresh_rate_secs = secs)
    }

    /// Remember when the next wake is due (`None` once cancelled).
    fn record_next_wake(&self, at_ms: Option<u64>) -> Result<(), ConfigError> {
        self.update(&mut |s| s.state.next_wake_at_ms = at_ms)
    }

    /// Cache the discovered panel size.
    fn record_screen_size(&self, width: u32, height: u32) -> Result<(), ConfigError> {
        self.update(&mut |s| {
            s.config.display.width = width;
            s.config.display.height = height;
        })
    }
}

/// In-memory store, for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    settings: Mutex<Settings>,
}

impl MemoryStore {
    /// Create a store holding `settings`
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }

    /// Create a store from a configuration with fresh state
    pub fn with_config(config: Config) -> Self {
        Self::new(Settings::from_config(config))
    }

    /// Copy of the current settings
    pub fn snapshot(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<Settings, ConfigError> {
        Ok(self.snapshot())
    }

    fn update(&self, change: &mut dyn FnMut(&mut Settings)) -> Result<(), ConfigError> {
        let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        change(&mut settings);
        Ok(())
    }
}

/// JSON file store
///
/// A missing file loads as defaults. Writes go to a sibling temp file that
/// is renamed over the original.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Store settings at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// File backing this store
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Settings, ConfigError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, settings: &Settings) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(settings)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<Settings, ConfigError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read()
    }

    fn update(&self, change: &mut dyn FnMut(&mut Settings)) -> Result<(), ConfigError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut settings = self.read()?;
        change(&mut settings);
        self.write(&settings)
    }
}
