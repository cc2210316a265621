//! Session authentication for the session guard
//!
//! Defines the `Session` credential, the `AuthProvider` capability the guard
//! consumes ("current session", "refresh session", "sign out"), and an HTTP
//! implementation against a GoTrue-compatible auth server. This crate has no
//! dependency on the guard itself and can be used and tested independently.
//!
//! Session flow:
//! 1. The application seeds `HttpAuthProvider::set_session()` with a refresh token
//! 2. The guard reads `current_session()` and checks expiry before each attempt
//! 3. Near expiry, the guard calls `refresh_session()` (single-flighted upstream)
//! 4. On escalation, the guard calls `sign_out()`, which always clears local state

pub mod constants;
pub mod error;
pub mod http;
pub mod provider;
pub mod session;

pub use error::{Error, Result};
pub use http::HttpAuthProvider;
pub use provider::AuthProvider;
pub use session::{Session, TokenResponse, unix_now_secs};
