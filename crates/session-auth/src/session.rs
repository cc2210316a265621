//! Session credential and freshness arithmetic
//!
//! A session carries an absolute expiry in unix seconds. Token endpoint
//! responses carry `expires_in` (a delta) and usually `expires_at`; the
//! absolute value wins when present.

use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};

/// An authenticated session issued by the auth provider.
#[derive(Debug, Clone)]
pub struct Session {
    /// Bearer token for backend calls
    pub access_token: Secret<String>,
    /// Token used to obtain the next session
    pub refresh_token: Secret<String>,
    /// Expiration as unix timestamp in seconds
    pub expires_at: u64,
    pub user_id: Option<String>,
}

impl Session {
    /// Session holding only a refresh token.
    ///
    /// `expires_at` is zero, so the first freshness check refreshes it into a
    /// usable session.
    pub fn from_refresh_token(refresh_token: Secret<String>) -> Self {
        Self {
            access_token: Secret::new(String::new()),
            refresh_token,
            expires_at: 0,
            user_id: None,
        }
    }

    /// Build a session from a token endpoint response received at `now_secs`.
    pub fn from_token_response(response: TokenResponse, now_secs: u64) -> Self {
        let expires_at = response
            .expires_at
            .unwrap_or(now_secs + response.expires_in);
        Self {
            access_token: Secret::new(response.access_token),
            refresh_token: Secret::new(response.refresh_token),
            expires_at,
            user_id: response.user.map(|u| u.id),
        }
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_at(&self, now_secs: u64) -> Duration {
        Duration::from_secs(self.expires_at.saturating_sub(now_secs))
    }

    /// Whether more than `threshold` remains before expiry at `now_secs`.
    pub fn is_fresh_at(&self, now_secs: u64, threshold: Duration) -> bool {
        self.remaining_at(now_secs) > threshold
    }

    /// `is_fresh_at` against the wall clock.
    pub fn is_fresh(&self, threshold: Duration) -> bool {
        self.is_fresh_at(unix_now_secs(), threshold)
    }
}

/// Current wall-clock time in unix seconds.
pub fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Response from the token endpoint for a refresh grant.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    /// Absolute expiry in unix seconds, when the server provides it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<TokenUser>,
}

/// Subset of the user object returned alongside tokens.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenUser {
    pub id: String,
}
