//! Shared types for the session guard workspace
//!
//! Holds the configuration error type used by every crate that validates
//! settings, and the `Secret` wrapper that keeps tokens and API keys out of
//! logs.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
