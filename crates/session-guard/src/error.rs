//! Error types surfaced by the guard

use std::time::Duration;

/// Failure of the freshness check that runs before every attempt.
///
/// `Clone` because a single in-flight refresh hands its outcome to every
/// waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FreshnessError {
    #[error("no active session")]
    NoSession,

    #[error("session refresh failed: {0}")]
    RefreshFailed(String),
}

/// Errors returned by `SessionGuard::run`.
///
/// `Operation` carries the wrapped operation's own error unchanged, so callers
/// can tell "the backend rejected this request" apart from "the guard gave up".
#[derive(Debug, thiserror::Error)]
pub enum GuardError<E> {
    #[error("no active session")]
    NoSession,

    #[error("session refresh failed: {0}")]
    RefreshFailed(String),

    #[error("circuit breaker is open, retry in {}s", .retry_after.as_secs())]
    CircuitOpen { retry_after: Duration },

    #[error("{message}")]
    SessionExhausted { message: String, attempts: u32 },

    #[error(transparent)]
    Operation(E),
}

impl<E> GuardError<E> {
    /// Stable machine-readable label for responses and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GuardError::NoSession => "no_session",
            GuardError::RefreshFailed(_) => "refresh_failed",
            GuardError::CircuitOpen { .. } => "circuit_open",
            GuardError::SessionExhausted { .. } => "session_exhausted",
            GuardError::Operation(_) => "operation",
        }
    }

    /// Attempts made before the guard gave up, when it did.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            GuardError::SessionExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl<E> From<FreshnessError> for GuardError<E> {
    fn from(err: FreshnessError) -> Self {
        match err {
            FreshnessError::NoSession => GuardError::NoSession,
            FreshnessError::RefreshFailed(msg) => GuardError::RefreshFailed(msg),
        }
    }
}

/// Result alias for guarded operations.
pub type Result<T, E> = std::result::Result<T, GuardError<E>>;
