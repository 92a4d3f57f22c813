//! Error taxonomy for the update cycle.
//!
//! | Error | Recovery |
//! |-------|----------|
//! | [`CycleError::ConnectivityTimeout`] | Full-cycle retry after the short retry interval |
//! | [`SetupError`] / [`FetchError`] | Retried inside the cycle, then the cached refresh rate is used |
//! | [`PlatformError`] / [`PowerError`] | Isolated per platform call, logged, never escalated by `wake`/`sleep` |
//!
//! A render timeout is not an error; it shows up as
//! [`RenderResolution::TimedOut`](crate::cycle::RenderResolution::TimedOut) in the cycle report.

use thiserror::Error;

/// Failure of a single platform call (shell tool, sysfs write, settings provider).
#[derive(Debug, Error)]
pub enum PlatformError {
    /// An external command exited unsuccessfully.
    #[error("command `{command}` failed with status {status}")]
    Command {
        /// The command line that was run.
        command: String,
        /// Exit status as reported by the OS (`-1` when killed by a signal).
        status: i32,
    },
    /// I/O failure talking to the platform.
    #[error("platform I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The platform answered with something we could not interpret.
    #[error("unexpected platform value: {0}")]
    Unexpected(String),
}

/// A best-effort power step that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Which step failed.
    pub step: &'static str,
    /// Platform error text.
    pub message: String,
}

/// One or more sub-steps of `wake`/`sleep` failed.
///
/// Every step is still attempted; this only reports what went wrong.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("power steps failed: {}", describe(.failures))]
pub struct PowerError {
    /// Failed steps, in the order they were attempted.
    pub failures: Vec<StepFailure>,
}

impl PowerError {
    /// Returns true if `step` is among the failures.
    pub fn failed(&self, step: &str) -> bool {
        self.failures.iter().any(|f| f.step == step)
    }
}

fn describe(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.step, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Transport-level HTTP failure (DNS, TLS, connection reset, timeout).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    /// Create a transport error from any displayable cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Device registration (`/api/setup/`) failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SetupError {
    /// Server answered with a non-2xx status.
    #[error("setup failed with code {code}: {body}")]
    Http {
        /// HTTP status code.
        code: u16,
        /// Response body, possibly empty.
        body: String,
    },
    /// The request never produced a response.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Display data (`/api/display`) or image download failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Server answered with a non-2xx status.
    #[error("unexpected code {code}: {body}")]
    Http {
        /// HTTP status code.
        code: u16,
        /// Response body, possibly empty.
        body: String,
    },
    /// Server answered 2xx with an empty body.
    #[error("empty response body")]
    Empty,
    /// Body was not the JSON document we expected.
    #[error("invalid JSON response: {0}")]
    Malformed(String),
    /// The request never produced a response.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One attempt of the surface's registration + fetch sequence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    /// Registration step failed.
    #[error(transparent)]
    Setup(#[from] SetupError),
    /// Display data step failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Reason a cycle ended as a retryable failure.
///
/// Platform failures inside `wake`/`sleep` are not here: they are isolated
/// and reported as [`PowerError`] without ending the cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    /// Connectivity never came up within the bounded retry loop.
    #[error("no connectivity after {attempts} attempts")]
    ConnectivityTimeout {
        /// Number of `ensure_connectivity` rounds that were tried.
        attempts: u32,
    },
    /// Settings could not be loaded at cycle start.
    #[error("could not load settings: {0}")]
    Config(#[from] ConfigError),
    /// Arming the next wake failed.
    #[error("could not arm next wake: {0}")]
    Scheduling(String),
    /// The cycle task panicked.
    #[error("cycle task panicked")]
    Panicked,
}

/// Persisted configuration could not be read or written.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File access failed.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored JSON did not match the expected shape.
    #[error("config format error: {0}")]
    Format(#[from] serde_json::Error),
}
