//! Session freshness checker with single-flight refresh
//!
//! At most one refresh is outstanding at a time. The first caller that finds
//! the session near expiry installs a shared refresh future in the slot; every
//! caller arriving while it runs awaits the same future and receives the same
//! outcome. Whoever observes completion clears the slot, so a failed refresh
//! never poisons later checks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use session_auth::{AuthProvider, Session};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::FreshnessError;
use crate::telemetry;

type RefreshFuture = Shared<BoxFuture<'static, Result<Session, FreshnessError>>>;

/// Keeps the provider's session fresh, deduplicating concurrent refreshes.
pub struct FreshnessChecker {
    auth: Arc<dyn AuthProvider>,
    threshold: Duration,
    /// In-flight refresh tagged with a generation id
    in_flight: Mutex<Option<(u64, RefreshFuture)>>,
    next_id: AtomicU64,
}

impl FreshnessChecker {
    pub fn new(auth: Arc<dyn AuthProvider>, threshold: Duration) -> Self {
        Self {
            auth,
            threshold,
            in_flight: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Return a session with more than `threshold` left before expiry.
    ///
    /// Fails with `NoSession` when the provider holds none; that is never
    /// retried here. A near-expiry session is refreshed through the shared
    /// in-flight refresh.
    pub async fn ensure_fresh(&self) -> Result<Session, FreshnessError> {
        let Some(session) = self.auth.current_session().await else {
            return Err(FreshnessError::NoSession);
        };
        if session.is_fresh(self.threshold) {
            return Ok(session);
        }
        debug!(
            provider = self.auth.id(),
            expires_at = session.expires_at,
            "session near expiry, refreshing"
        );
        self.join_or_start(true).await
    }

    /// Refresh unconditionally, joining an in-flight refresh if one exists.
    pub async fn refresh(&self) -> Result<Session, FreshnessError> {
        self.join_or_start(false).await
    }

    /// Join the in-flight refresh or start one. With `recheck`, the session is
    /// sampled again under the slot lock so a caller whose stale sample raced
    /// a just-finished refresh takes the new session instead of refreshing.
    async fn join_or_start(&self, recheck: bool) -> Result<Session, FreshnessError> {
        let (id, refresh) = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some((id, refresh)) => {
                    debug!(generation = *id, "joining in-flight session refresh");
                    (*id, refresh.clone())
                }
                None => {
                    if recheck {
                        match self.auth.current_session().await {
                            None => return Err(FreshnessError::NoSession),
                            Some(session) if session.is_fresh(self.threshold) => {
                                debug!("session refreshed by another caller");
                                return Ok(session);
                            }
                            Some(_) => {}
                        }
                    }
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let refresh = self.start_refresh();
                    *slot = Some((id, refresh.clone()));
                    (id, refresh)
                }
            }
        };

        let result = refresh.await;

        {
            let mut slot = self.in_flight.lock().await;
            if slot.as_ref().is_some_and(|(current, _)| *current == id) {
                *slot = None;
            }
        }

        result
    }

    fn start_refresh(&self) -> RefreshFuture {
        let auth = Arc::clone(&self.auth);
        async move {
            match auth.refresh_session().await {
                Ok(session) => {
                    telemetry::record_refresh("success");
                    Ok(session)
                }
                Err(session_auth::Error::NoSession) => {
                    telemetry::record_refresh("failure");
                    Err(FreshnessError::NoSession)
                }
                Err(e) => {
                    telemetry::record_refresh("failure");
                    warn!(provider = auth.id(), error = %e, "Session refresh failed");
                    Err(FreshnessError::RefreshFailed(e.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }
}
