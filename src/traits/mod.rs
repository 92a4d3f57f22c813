//! Trait definitions for the platform, network and display seams.
//!
//! These abstractions let the update cycle:
//! - Run on the rooted device or against desktop mocks
//! - Use any HTTP client
//! - Paint through any rendering surface
//!
//! # Submodules
//!
//! - `hardware`: Power primitives, battery, wake alarm, clock
//! - `network`: HTTP client trait and request/response types
//! - `display`: Panel sink and rendering surface
//!
//! # Platform Abstraction
//!
//! The key platform traits are:
//!
//! - [`PowerPlatform`]: radio, connectivity, power-enhance toggle, wake hold
//! - [`WakeAlarm`]: exact-time hardware wake
//! - [`RenderSurface`]: fetch/display sequence that reports completion signals

pub mod display;
pub mod hardware;
pub mod network;

pub use display::*;
pub use hardware::*;
pub use network::*;
