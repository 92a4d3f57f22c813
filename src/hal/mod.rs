//! Hardware Abstraction Layer implementations.
//!
//! This module contains concrete implementations of the traits
//! defined in [`crate::traits`] for various platforms.
//!
//! # Available Implementations
//!
//! - `mock`: Test implementations for desktop development
//! - `android`: Rooted e-reader (requires `android` feature)
//! - `http`: reqwest-backed HTTP client (requires `http` feature)

pub mod mock;

#[cfg(feature = "android")]
pub mod android;

#[cfg(feature = "http")]
pub mod http;

pub use mock::*;

#[cfg(feature = "android")]
pub use android::*;

#[cfg(feature = "http")]
pub use http::*;
