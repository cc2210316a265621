//! Failure classification for guarded operations
//!
//! Decides whether a failed attempt is retried and whether it counts toward
//! the circuit breaker. Session and permission failures and 5xx responses
//! are `Auth`: retried, and a trip on exhaustion. Timeouts, dropped
//! connections, 408 and 429 are `Transient`: retried, never tripping. The rest
//! is `Fatal` and passes through untouched.

use serde::Deserialize;

/// Backend error codes that indicate a session or permission problem.
///
/// `P0001`/`P0002` are raised by the backend's RPC functions when the caller's
/// session can't be resolved, `42501` is a Postgres privilege failure, and
/// `PGRST301`/`PGRST303` are the REST layer's JWT rejection codes.
pub const AUTH_ERROR_CODES: &[&str] = &["P0001", "P0002", "42501", "PGRST301", "PGRST303"];

/// How the guard treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Session/permission failure or 5xx: retry, and trip the breaker on exhaustion
    Auth,
    /// Retry under the same backoff, never counted by the breaker
    Transient,
    /// Not retried
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Fatal)
    }

    /// Label for logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            ErrorClass::Auth => "auth",
            ErrorClass::Transient => "transient",
            ErrorClass::Fatal => "fatal",
        }
    }
}

/// Implemented by every error type a guarded operation can fail with.
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

/// Whether `code` is one of the backend's session/permission codes.
pub fn is_auth_code(code: &str) -> bool {
    AUTH_ERROR_CODES.contains(&code)
}

/// Classify by HTTP status alone.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        401 | 403 => ErrorClass::Auth,
        500..=599 => ErrorClass::Auth,
        408 | 429 => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

/// Error body shape returned by the backend's REST layer.
#[derive(Debug, Deserialize)]
struct BackendErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Classify an error response by body error code, then by status.
///
/// Some RPC functions surface session failures as a bare message equal to the
/// code, so both `code` and `message` are checked.
pub fn classify_response(status: u16, body: &str) -> ErrorClass {
    if let Ok(parsed) = serde_json::from_str::<BackendErrorBody>(body) {
        let matched = [parsed.code.as_deref(), parsed.message.as_deref()]
            .into_iter()
            .flatten()
            .any(is_auth_code);
        if matched {
            return ErrorClass::Auth;
        }
    }
    classify_status(status)
}
