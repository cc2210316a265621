//! Service-specific error types

use thiserror::Error;

/// Startup errors for the gateway.
///
/// Per-request failures are turned into JSON responses by the proxy handler
/// and never propagate as Rust errors.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[error("auth API key missing: set GUARD_API_KEY or auth.api_key_file")]
    MissingApiKey,

    #[error("refresh token missing: set GUARD_REFRESH_TOKEN or auth.refresh_token_file")]
    MissingRefreshToken,

    #[error("invalid guard settings: {0}")]
    InvalidGuard(#[from] common::Error),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
