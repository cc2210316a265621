//! In-memory auth provider shared by the guard's unit tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use session_auth::{AuthProvider, Session, unix_now_secs};
use tokio::sync::Mutex;

/// Counts refresh and sign-out calls. Refreshes sleep for `refresh_delay` so
/// concurrent callers overlap; lookups hand back a snapshot taken
/// `lookup_delay` earlier.
pub(crate) struct MockAuth {
    session: Mutex<Option<Session>>,
    pub refreshes: AtomicUsize,
    pub sign_outs: AtomicUsize,
    pub fail_refresh: AtomicBool,
    refresh_delay: Duration,
    lookup_delay: Duration,
}

impl MockAuth {
    pub fn new(session: Option<Session>) -> Self {
        Self {
            session: Mutex::new(session),
            refreshes: AtomicUsize::new(0),
            sign_outs: AtomicUsize::new(0),
            fail_refresh: AtomicBool::new(false),
            refresh_delay: Duration::from_millis(50),
            lookup_delay: Duration::ZERO,
        }
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = delay;
        self
    }

    /// Provider holding a session valid for another hour.
    pub fn fresh() -> Self {
        Self::new(Some(session_expiring_in(3600)))
    }

    /// Provider holding an already expired session.
    pub fn stale() -> Self {
        Self::new(Some(session_expiring_in(0)))
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn sign_outs(&self) -> usize {
        self.sign_outs.load(Ordering::SeqCst)
    }

    pub async fn expire(&self) {
        if let Some(session) = self.session.lock().await.as_mut() {
            session.expires_at = 0;
        }
    }
}

pub(crate) fn session_expiring_in(secs: u64) -> Session {
    Session {
        access_token: "at_test".into(),
        refresh_token: "rt_test".into(),
        expires_at: unix_now_secs() + secs,
        user_id: Some("user-1".into()),
    }
}

impl AuthProvider for MockAuth {
    fn id(&self) -> &str {
        "mock"
    }

    fn current_session(&self) -> Pin<Box<dyn Future<Output = Option<Session>> + Send + '_>> {
        Box::pin(async move {
            let snapshot = self.session.lock().await.clone();
            if !self.lookup_delay.is_zero() {
                tokio::time::sleep(self.lookup_delay).await;
            }
            snapshot
        })
    }

    fn refresh_session(
        &self,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<Session>> + Send + '_>> {
        Box::pin(async move {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.refresh_delay).await;
            if self.fail_refresh.load(Ordering::SeqCst) {
                return Err(session_auth::Error::InvalidCredentials(
                    "refresh token revoked".into(),
                ));
            }
            let session = session_expiring_in(3600);
            *self.session.lock().await = Some(session.clone());
            Ok(session)
        })
    }

    fn sign_out(&self) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.sign_outs.fetch_add(1, Ordering::SeqCst);
            self.session.lock().await.take();
            Ok(())
        })
    }
}

/// Sink that keeps every event for later assertions.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: std::sync::Mutex<Vec<crate::telemetry::SessionEvent>>,
}

impl RecordingSink {
    pub fn kinds(&self) -> Vec<crate::telemetry::EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }
}

impl crate::telemetry::TelemetrySink for RecordingSink {
    fn record(&self, event: &crate::telemetry::SessionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
