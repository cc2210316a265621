//! GoTrue-compatible HTTP auth provider
//!
//! Holds the current session in memory behind a tokio `RwLock` and talks to
//! two endpoints:
//! 1. Token refresh (`REFRESH_PATH`), JSON body `{"refresh_token": ...}`
//! 2. Logout (`LOGOUT_PATH`), bearer-authenticated
//!
//! Every request carries the project API key in the `apikey` header.
//!
//! Sign-out bumps an epoch under the session write lock. A refresh that was
//! already in flight when the session was revoked sees the changed epoch and
//! drops its result instead of reinstalling a live session.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use common::Secret;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::constants::{API_KEY_HEADER, LOGOUT_PATH, REFRESH_PATH};
use crate::error::{Error, Result};
use crate::provider::AuthProvider;
use crate::session::{Session, TokenResponse, unix_now_secs};

/// Auth provider backed by a GoTrue-style auth server.
pub struct HttpAuthProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Secret<String>,
    session: RwLock<Option<Session>>,
    /// Incremented on every sign-out, only while holding the write lock
    epoch: AtomicU64,
}

impl HttpAuthProvider {
    /// Create a provider with no session. Seed one with `set_session`.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: Secret<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            session: RwLock::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    /// Replace the held session.
    pub async fn set_session(&self, session: Session) {
        debug!(expires_at = session.expires_at, "session installed");
        *self.session.write().await = Some(session);
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn refresh(&self) -> Result<Session> {
        let (refresh, epoch) = {
            let guard = self.session.read().await;
            match guard.as_ref() {
                Some(session) => (
                    session.refresh_token.clone(),
                    self.epoch.load(Ordering::Acquire),
                ),
                None => return Err(Error::NoSession),
            }
        };

        let response = self
            .client
            .post(self.url(REFRESH_PATH))
            .header(API_KEY_HEADER, self.api_key.expose().as_str())
            .json(&serde_json::json!({ "refresh_token": refresh.expose() }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 400 invalid_grant, 401 and 403 mean the refresh token is revoked or reused
            if matches!(status.as_u16(), 400 | 401 | 403) {
                return Err(Error::InvalidCredentials(format!(
                    "refresh token rejected ({status}): {body}"
                )));
            }

            return Err(Error::TokenExchange(format!(
                "token refresh returned {status}: {body}"
            )));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;

        let session = Session::from_token_response(token, unix_now_secs());
        {
            let mut held = self.session.write().await;
            if self.epoch.load(Ordering::Acquire) != epoch {
                warn!("signed out while refreshing, discarding refreshed session");
                return Err(Error::NoSession);
            }
            *held = Some(session.clone());
        }
        info!(expires_at = session.expires_at, "session refreshed");
        Ok(session)
    }

    async fn logout(&self) -> Result<()> {
        // Clear first so a failed revocation still leaves the process signed out
        let taken = {
            let mut held = self.session.write().await;
            self.epoch.fetch_add(1, Ordering::AcqRel);
            held.take()
        };
        let Some(session) = taken else {
            debug!("sign-out requested with no session held");
            return Ok(());
        };

        let response = self
            .client
            .post(self.url(LOGOUT_PATH))
            .header(API_KEY_HEADER, self.api_key.expose().as_str())
            .bearer_auth(session.access_token.expose())
            .send()
            .await
            .map_err(|e| Error::Http(format!("logout request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "logout endpoint rejected revocation, local session cleared anyway");
            return Err(Error::Http(format!("logout returned {status}")));
        }

        info!("session revoked");
        Ok(())
    }
}

impl AuthProvider for HttpAuthProvider {
    fn id(&self) -> &str {
        "gotrue"
    }

    fn current_session(&self) -> Pin<Box<dyn Future<Output = Option<Session>> + Send + '_>> {
        Box::pin(async move { self.session.read().await.clone() })
    }

    fn refresh_session(&self) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + '_>> {
        Box::pin(self.refresh())
    }

    fn sign_out(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.logout())
    }
}
