//! Loggest Common Library
//!
//! Shared types and error handling for the loggest test runner.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// Loggest runner version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
