//! Size-bounded on-disk activity journal.
//!
//! One line per cycle step, `YYYY-MM-DD HH:MM:SS.mmm - message`, in local
//! time. When the file grows past its limit the older half of the lines is
//! dropped before the next append. The journal is for reading on the device
//! after the fact; it is not a replacement for the `log` output, and write
//! failures are only logged.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use log::warn;

/// Default size limit (1 MiB).
pub const DEFAULT_LIMIT_BYTES: u64 = 1024 * 1024;

/// Append-only journal with half-trimming.
#[derive(Debug)]
pub struct ActivityLog {
    path: PathBuf,
    limit_bytes: u64,
    lock: Mutex<()>,
}

impl ActivityLog {
    /// Journal at `path`, trimmed once larger than `limit_bytes`.
    ///
    /// The file is created lazily on the first record.
    pub fn open(path: impl Into<PathBuf>, limit_bytes: u64) -> Self {
        Self {
            path: path.into(),
            limit_bytes,
            lock: Mutex::new(()),
        }
    }

    /// File backing the journal.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line.
    pub fn record(&self, message: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let line = format!(
            "{} - {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            message
        );
        if let Err(e) = self.trim() {
            warn!("failed to trim activity log {}: {e}", self.path.display());
        }
        if let Err(e) = self.append(&line) {
            warn!("failed to write activity log {}: {e}", self.path.display());
        }
    }

    fn trim(&self) -> std::io::Result<()> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if len <= self.limit_bytes {
            return Ok(());
        }
        let bytes = fs::read(&self.path)?;
        let content = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = content.lines().collect();
        let keep = &lines[lines.len() - lines.len() / 2..];
        let mut trimmed = keep.join("\n");
        trimmed.push('\n');
        fs::write(&self.path, trimmed)
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}
