//! File-backed display sink.
//!
//! The daemon does not draw. It hands each frame to whatever viewer is
//! pointed at its output directory: the image bytes as `current.png` and
//! the overlay/debug text as `status.txt`, both replaced atomically.

use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::run;
use crate::error::PlatformError;
use crate::traits::{DisplayFrame, DisplaySink};

const IMAGE_FILE: &str = "current.png";
const STATUS_FILE: &str = "status.txt";

/// [`DisplaySink`] writing frames into a directory.
#[derive(Debug, Clone)]
pub struct FileDisplay {
    dir: PathBuf,
}

impl FileDisplay {
    /// Sink writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn replace(&self, name: &str, contents: &[u8]) -> Result<(), PlatformError> {
        let target = self.dir.join(name);
        let tmp = self.dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }
}

impl DisplaySink for FileDisplay {
    type Error = PlatformError;

    async fn show(&self, frame: DisplayFrame) -> Result<(), PlatformError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        if let Some(image) = &frame.image {
            self.replace(IMAGE_FILE, image).await?;
            debug!("wrote {} ({} bytes)", frame.filename, image.len());
        }
        let mut status = frame.overlay.text();
        if let Some(text) = &frame.debug_text {
            status.push('\n');
            status.push_str(text);
        }
        status.push('\n');
        self.replace(STATUS_FILE, status.as_bytes()).await
    }

    async fn dimensions(&self) -> Option<(u32, u32)> {
        match run("wm", &["size"]).await {
            Ok(text) => parse_wm_size(&text),
            Err(e) => {
                warn!("could not query screen size: {e}");
                None
            }
        }
    }
}

/// Parse `wm size` output into `(width, height)` for the landscape image.
///
/// `wm` reports the portrait panel; the server renders landscape, so the
/// axes are swapped. An override size wins over the physical one.
fn parse_wm_size(text: &str) -> Option<(u32, u32)> {
    let line = text
        .lines()
        .find(|l| l.starts_with("Override size:"))
        .or_else(|| text.lines().find(|l| l.starts_with("Physical size:")))?;
    let (_, dims) = line.split_once(':')?;
    let (w, h) = dims.trim().split_once('x')?;
    Some((h.trim().parse().ok()?, w.trim().parse().ok()?))
}
