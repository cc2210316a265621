//! Error types for session authentication

/// Errors from auth provider operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token refresh failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("no active session")]
    NoSession,
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
