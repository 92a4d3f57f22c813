//! Network round trip: device registration, display payload, image download.
//!
//! [`UpdateFetcher`] issues single requests and maps every failure to a
//! typed error. Retrying is the caller's business; [`RetryPolicy`] provides
//! the fixed-backoff loop the rendering surface uses.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::config::Config;
use crate::error::{FetchError, SetupError};
use crate::traits::{HttpClient, HttpRequest};

/// Refresh rate assumed when the server omits one.
pub const DEFAULT_REFRESH_SECS: u32 = 60;

/// File name assumed when the server omits one.
pub const DEFAULT_FILENAME: &str = "display.png";

// JSON-escaped ampersand some servers leave in image URLs after decoding.
const ESCAPED_AMPERSAND: &str = "\\u0026";

// ============================================================================
// Payload
// ============================================================================

/// Parsed `/api/display` response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayPayload {
    /// Image to download and show.
    pub image_url: String,
    /// Seconds until the next wake; always positive.
    pub refresh_rate_secs: u32,
    /// Server-side image name.
    pub filename: String,
}

#[derive(Deserialize)]
struct RawPayload {
    image_url: String,
    #[serde(default)]
    refresh_rate: Option<Value>,
    #[serde(default)]
    filename: Option<String>,
}

impl DisplayPayload {
    /// Parse a display response body.
    ///
    /// `image_url` is required. `refresh_rate` accepts a number or a numeric
    /// string and defaults to 60 when missing, unparsable or not positive.
    /// `filename` defaults to `display.png`.
    ///
    /// ```rust
    /// use nook_trmnl::fetch::DisplayPayload;
    ///
    /// let p = DisplayPayload::from_json(r#"{"image_url":"http://x/y.png"}"#).unwrap();
    /// assert_eq!(p.refresh_rate_secs, 60);
    /// assert_eq!(p.filename, "display.png");
    /// ```
    pub fn from_json(body: &str) -> Result<Self, FetchError> {
        if body.trim().is_empty() {
            return Err(FetchError::Empty);
        }
        let raw: RawPayload =
            serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

        let refresh_rate_secs = match raw.refresh_rate.as_ref().and_then(rate_from_value) {
            Some(rate) if rate > 0 => u32::try_from(rate).unwrap_or(u32::MAX),
            Some(rate) => {
                warn!("ignoring non-positive refresh_rate {rate}");
                DEFAULT_REFRESH_SECS
            }
            None => DEFAULT_REFRESH_SECS,
        };

        Ok(Self {
            image_url: raw.image_url.replace(ESCAPED_AMPERSAND, "&"),
            refresh_rate_secs,
            filename: raw
                .filename
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| DEFAULT_FILENAME.to_string()),
        })
    }
}

fn rate_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Result of [`UpdateFetcher::register_device_if_stale`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// The previous registration is still within the staleness window.
    Fresh,
    /// A setup call succeeded at the given epoch ms.
    Registered {
        /// When the registration happened.
        at_ms: u64,
    },
}

/// Returns true when a registration at `last_ms` is at least `staleness` old
/// at `now_ms`, or when there never was one.
pub fn is_registration_stale(last_ms: Option<u64>, now_ms: u64, staleness: Duration) -> bool {
    match last_ms {
        None => true,
        Some(last) => now_ms.saturating_sub(last) >= staleness.as_millis() as u64,
    }
}

// ============================================================================
// Fetcher
// ============================================================================

/// Issues the display server requests over an [`HttpClient`].
#[derive(Debug, Clone)]
pub struct UpdateFetcher<H> {
    http: H,
}

impl<H: HttpClient> UpdateFetcher<H> {
    /// Create a fetcher.
    pub fn new(http: H) -> Self {
        Self { http }
    }

    /// The underlying client.
    pub fn http(&self) -> &H {
        &self.http
    }

    /// Call `/api/setup/` unless the last registration is recent enough.
    pub async fn register_device_if_stale(
        &self,
        config: &Config,
        last_registered_at: Option<u64>,
        now_ms: u64,
    ) -> Result<Registration, SetupError> {
        let staleness = Duration::from_secs(config.cycle.registration_staleness_secs);
        if !is_registration_stale(last_registered_at, now_ms, staleness) {
            debug!("registration still fresh");
            return Ok(Registration::Fresh);
        }

        let url = config.server.url("/api/setup/");
        info!("setting up device at {url}");
        let request = HttpRequest::get(url)
            .header("ID", config.device.id.as_str())
            .header("Accept", "application/json")
            .header("Content-Type", "application/json");

        let response = self.http.get(request).await?;
        if !response.is_success() {
            let body = response.body_lossy();
            warn!("setup error response {}: {body}", response.status);
            return Err(SetupError::Http {
                code: response.status,
                body,
            });
        }
        info!("device setup successful");
        Ok(Registration::Registered { at_ms: now_ms })
    }

    /// Call `/api/display` and parse the payload.
    pub async fn fetch_display_payload(
        &self,
        config: &Config,
        battery_level: u8,
        screen_width: u32,
        screen_height: u32,
    ) -> Result<DisplayPayload, FetchError> {
        let url = config.server.url("/api/display");
        debug!("requesting {url}");
        let request = HttpRequest::get(url)
            .header("ID", config.device.id.as_str())
            .header("Access-Token", config.device.access_token.as_str())
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .header("battery-level", battery_level.to_string())
            .header("png-width", screen_width.to_string())
            .header("png-height", screen_height.to_string())
            .header("rssi", "0")
            .header("User-Agent", config.server.user_agent.as_str());

        let response = self.http.get(request).await?;
        if !response.is_success() {
            let body = response.body_lossy();
            warn!("display error response {}: {body}", response.status);
            return Err(FetchError::Http {
                code: response.status,
                body,
            });
        }
        if response.body.is_empty() {
            return Err(FetchError::Empty);
        }
        let body = response
            .body_str()
            .ok_or_else(|| FetchError::Malformed("body is not UTF-8".into()))?;
        let payload = DisplayPayload::from_json(body)?;
        debug!(
            "parsed payload: {} ({}s, {})",
            payload.image_url, payload.refresh_rate_secs, payload.filename
        );
        Ok(payload)
    }

    /// Download the rendered image.
    pub async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .http
            .get(HttpRequest::get(url).header("Accept", "image/*"))
            .await?;
        if !response.is_success() {
            return Err(FetchError::Http {
                code: response.status,
                body: response.body_lossy(),
            });
        }
        if response.body.is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(response.body)
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Fixed-backoff retry loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (at least one is always made).
    pub attempts: u32,
    /// Delay between attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// `attempts` tries, `backoff` apart.
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Fetch policy from the cycle configuration.
    pub fn for_fetch(config: &Config) -> Self {
        Self::new(
            config.cycle.fetch_attempts,
            Duration::from_millis(config.cycle.fetch_backoff_ms),
        )
    }

    /// Run `op` until it succeeds or the attempts run out.
    ///
    /// `op` receives the 1-based attempt number. There is no delay after the
    /// final failure; its error is returned.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    warn!("{label} failed after {attempts} attempts: {e}");
                    return Err(e);
                }
                Err(e) => {
                    warn!("{label} attempt {attempt}/{attempts} failed: {e}");
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
