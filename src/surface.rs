//! The rendering surface the daemon runs with.
//!
//! [`FetchingSurface`] does the whole fetch/display sequence on a spawned
//! task for every [`UpdateRequest`]:
//!
//! 1. register the device if stale, read the battery, request the display
//!    payload, retried as a unit with a fixed backoff
//! 2. report network completion with the server's refresh rate
//! 3. download the image and paint it with the status overlay
//! 4. report render completion
//!
//! When every attempt fails it reports network completion with the fallback
//! rate it was handed (tagged [`CompletionSource::ErrorFallback`]) and never
//! reports render completion.

use std::sync::Arc;

use chrono::Local;
use log::{debug, error, info, warn};

use crate::config::{Config, ConfigStore};
use crate::error::UpdateError;
use crate::fetch::{DisplayPayload, Registration, RetryPolicy, UpdateFetcher};
use crate::signals::{CompletionSource, UpdateRequest};
use crate::traits::{
    BatteryMonitor, Clock, DisplayFrame, DisplaySink, HttpClient, RenderSurface, StatusOverlay,
};

/// Battery level reported when the platform can't tell.
pub const UNKNOWN_BATTERY_LEVEL: u8 = 100;

/// Reference [`RenderSurface`]: HTTP fetch plus a [`DisplaySink`].
pub struct FetchingSurface<H, D, B> {
    inner: Arc<Inner<H, D, B>>,
}

struct Inner<H, D, B> {
    fetcher: UpdateFetcher<H>,
    sink: D,
    battery: B,
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
}

struct Fetched {
    payload: DisplayPayload,
    battery: u8,
    width: u32,
    height: u32,
}

impl<H, D, B> FetchingSurface<H, D, B>
where
    H: HttpClient + 'static,
    D: DisplaySink + 'static,
    B: BatteryMonitor + 'static,
{
    /// Surface fetching over `http` and painting on `sink`.
    pub fn new(
        http: H,
        sink: D,
        battery: B,
        store: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher: UpdateFetcher::new(http),
                sink,
                battery,
                store,
                clock,
            }),
        }
    }

    /// The panel.
    pub fn sink(&self) -> &D {
        &self.inner.sink
    }
}

impl<H, D, B> RenderSurface for FetchingSurface<H, D, B>
where
    H: HttpClient + 'static,
    D: DisplaySink + 'static,
    B: BatteryMonitor + 'static,
{
    fn request_update(&self, request: UpdateRequest) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.update(request).await });
    }
}

impl<H, D, B> Inner<H, D, B>
where
    H: HttpClient,
    D: DisplaySink,
    B: BatteryMonitor,
{
    async fn update(&self, request: UpdateRequest) {
        let UpdateRequest {
            cycle_id,
            config,
            fallback_refresh_secs,
            signals,
        } = request;
        debug!("cycle {cycle_id}: surface starting fetch");

        let policy = RetryPolicy::for_fetch(&config);
        let fetched = policy
            .run("display update", |attempt| {
                debug!("cycle {cycle_id}: fetch attempt {attempt}");
                self.fetch(&config)
            })
            .await;

        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                error!("cycle {cycle_id}: update failed: {e}");
                if config.display.show_debug_info {
                    let battery = self.battery_level().await;
                    self.paint(DisplayFrame {
                        image: None,
                        filename: String::new(),
                        overlay: overlay(battery),
                        debug_text: Some(format!("Error: {e}")),
                    })
                    .await;
                }
                signals.network_complete(
                    i64::from(fallback_refresh_secs),
                    CompletionSource::ErrorFallback,
                );
                return;
            }
        };

        let Fetched {
            payload,
            battery,
            width,
            height,
        } = fetched;
        signals.network_complete(
            i64::from(payload.refresh_rate_secs),
            CompletionSource::ApiResponse,
        );

        let image = match self.fetcher.fetch_image(&payload.image_url).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("cycle {cycle_id}: image download failed: {e}");
                None
            }
        };

        let debug_text = config.display.show_debug_info.then(|| {
            format!(
                "URL: {}\nFile: {}\nRefresh: {}s\nScreen: {}x{}\nBattery: {}%",
                payload.image_url, payload.filename, payload.refresh_rate_secs, width, height, battery
            )
        });
        let painted = self
            .paint(DisplayFrame {
                image,
                filename: payload.filename,
                overlay: overlay(battery),
                debug_text,
            })
            .await;
        if painted {
            signals.render_complete();
        }
    }

    async fn fetch(&self, config: &Config) -> Result<Fetched, UpdateError> {
        let now = self.clock.now_ms();
        let last = match self.store.load() {
            Ok(settings) => settings.state.last_registration_ms,
            Err(e) => {
                warn!("could not read registration time: {e}");
                None
            }
        };
        if let Registration::Registered { at_ms } = self
            .fetcher
            .register_device_if_stale(config, last, now)
            .await?
        {
            if let Err(e) = self.store.record_registration(at_ms) {
                warn!("could not persist registration time: {e}");
            }
        }

        let battery = self.battery_level().await;
        let (width, height) = self.screen_size(config).await;

        let payload = self
            .fetcher
            .fetch_display_payload(config, battery, width, height)
            .await?;
        info!(
            "display payload: {} ({}s)",
            payload.filename, payload.refresh_rate_secs
        );
        Ok(Fetched {
            payload,
            battery,
            width,
            height,
        })
    }

    async fn battery_level(&self) -> u8 {
        self.battery
            .battery_level()
            .await
            .unwrap_or(UNKNOWN_BATTERY_LEVEL)
    }

    async fn screen_size(&self, config: &Config) -> (u32, u32) {
        if let Some(size) = config.display.size() {
            return size;
        }
        match self.sink.dimensions().await {
            Some((width, height)) => {
                info!("discovered screen size {width}x{height}");
                if let Err(e) = self.store.record_screen_size(width, height) {
                    warn!("could not cache screen size: {e}");
                }
                (width, height)
            }
            None => {
                warn!("screen size unknown");
                (0, 0)
            }
        }
    }

    async fn paint(&self, frame: DisplayFrame) -> bool {
        match self.sink.show(frame).await {
            Ok(()) => true,
            Err(e) => {
                error!("could not paint frame: {e}");
                false
            }
        }
    }
}

fn overlay(battery: u8) -> StatusOverlay {
    StatusOverlay {
        battery,
        updated_at: Local::now().format("%H:%M").to_string(),
    }
}
