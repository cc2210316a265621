//! Auth provider abstraction consumed by the session guard
//!
//! The guard never talks to an auth server directly. It reads the current
//! session, asks for a refresh when expiry is near, and signs out when
//! failures persist past the escalation threshold.

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::session::Session;

/// Capability exposed by an authentication provider.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn AuthProvider>`).
pub trait AuthProvider: Send + Sync {
    /// Identifier for logging (e.g. "gotrue")
    fn id(&self) -> &str;

    /// The session currently held, if any. Never performs network I/O.
    fn current_session(&self) -> Pin<Box<dyn Future<Output = Option<Session>> + Send + '_>>;

    /// Exchange the current refresh token for a new session and store it.
    fn refresh_session(&self) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + '_>>;

    /// Revoke the session. Local state is cleared even if revocation fails.
    fn sign_out(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
