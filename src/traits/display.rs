//! Display abstractions: the panel itself and the rendering surface that
//! drives it.
//!
//! The [`RenderSurface`] is what the cycle coordinator talks to. It owns the
//! fetch/decode/paint sequence and reports back through the per-cycle
//! signals carried in the [`UpdateRequest`]. The [`DisplaySink`] is the
//! lower-level "put these pixels on the panel" seam used by
//! [`FetchingSurface`](crate::surface::FetchingSurface).

use core::fmt::Display;
use core::future::Future;

use crate::signals::UpdateRequest;

/// Rendering surface driven by the cycle coordinator.
///
/// # Implementation Notes
///
/// - `request_update` must return promptly; do the work on a spawned task
/// - Report `NetworkComplete` at most once and `RenderComplete` at most once
///   through `request.signals`; signals sent after the coordinator moved on
///   are dropped
/// - Never report at all is a valid outcome; the coordinator times out
pub trait RenderSurface: Send + Sync {
    /// Begin a fetch/display sequence for one cycle.
    fn request_update(&self, request: UpdateRequest);
}

/// Status line painted with every frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusOverlay {
    /// Battery level in percent.
    pub battery: u8,
    /// Local time of the update, `HH:MM`.
    pub updated_at: String,
}

impl StatusOverlay {
    /// Text shown in the overlay corner.
    pub fn text(&self) -> String {
        format!("{}%  Updated: {}", self.battery, self.updated_at)
    }
}

/// One full-screen frame handed to a [`DisplaySink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayFrame {
    /// Encoded image bytes, or `None` to keep the previous picture.
    pub image: Option<Vec<u8>>,
    /// Server-provided file name for the image.
    pub filename: String,
    /// Battery/time overlay.
    pub overlay: StatusOverlay,
    /// Developer-facing status block, when debug info is enabled.
    pub debug_text: Option<String>,
}

/// The physical panel (or whatever stands in for it).
pub trait DisplaySink: Send + Sync {
    /// Error type for display operations.
    type Error: Display + Send;

    /// Paint a frame. Returns once the panel accepted it.
    fn show(&self, frame: DisplayFrame) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Native panel size in pixels as `(width, height)`, if discoverable.
    fn dimensions(&self) -> impl Future<Output = Option<(u32, u32)>> + Send;
}
