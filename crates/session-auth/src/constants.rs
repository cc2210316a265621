//! GoTrue endpoint paths
//!
//! Relative to the auth server base URL. The refresh grant is selected via
//! the query string, the credential itself travels in the JSON body.

/// Refresh-token grant on the token endpoint
pub const REFRESH_PATH: &str = "/auth/v1/token?grant_type=refresh_token";

/// Server-side session revocation
pub const LOGOUT_PATH: &str = "/auth/v1/logout";

/// Header carrying the project's public API key on every auth request
pub const API_KEY_HEADER: &str = "apikey";
