//! Retry executor
//!
//! `SessionGuard::run` wraps a remote operation:
//! 1. Fail fast with `CircuitOpen` while the breaker is open
//! 2. Ensure the session is fresh
//! 3. Invoke the operation; on success reset the breaker
//! 4. On a retryable failure with budget left, back off, re-check freshness, retry
//! 5. On exhaustion of an auth failure, trip the breaker (possibly escalating
//!    to a forced sign-out) and return `SessionExhausted`; any other terminal
//!    failure is returned unchanged

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use session_auth::{AuthProvider, Session};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::breaker::{CircuitBreaker, TripOutcome};
use crate::classify::{Classify, ErrorClass};
use crate::config::{GuardConfig, RetryConfig};
use crate::error::{FreshnessError, GuardError, Result};
use crate::freshness::FreshnessChecker;
use crate::telemetry::{self, EventKind, SessionEvent, TelemetrySink};

/// Reason attached to a forced sign-out.
pub const SIGN_OUT_REASON: &str = "session";

/// Authentication state published to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Active,
    /// The guard revoked the session; the application should return to its
    /// logged-out state
    SignedOut { reason: &'static str },
}

/// Session resilience guard. Share one instance per process via `Arc`.
pub struct SessionGuard {
    auth: Arc<dyn AuthProvider>,
    freshness: FreshnessChecker,
    breaker: CircuitBreaker,
    config: GuardConfig,
    sinks: Vec<Arc<dyn TelemetrySink>>,
    auth_state: watch::Sender<AuthState>,
    /// Forced sign-outs so far; bumped inside the watch channel's lock
    sign_outs: AtomicU64,
}

impl SessionGuard {
    pub fn new(auth: Arc<dyn AuthProvider>, config: GuardConfig) -> Self {
        let (auth_state, _) = watch::channel(AuthState::Active);
        Self {
            freshness: FreshnessChecker::new(auth.clone(), config.refresh_threshold),
            breaker: CircuitBreaker::new(config.breaker_duration, config.auto_signout_delay),
            auth,
            config,
            sinks: Vec::new(),
            auth_state,
            sign_outs: AtomicU64::new(0),
        }
    }

    /// Add a telemetry sink.
    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Watch for forced sign-outs.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.auth_state.subscribe()
    }

    pub fn auth_state(&self) -> AuthState {
        *self.auth_state.borrow()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Freshness check outside a guarded call.
    pub async fn ensure_fresh(&self) -> std::result::Result<Session, FreshnessError> {
        self.freshness.ensure_fresh().await
    }

    /// Run `op` under the process-wide retry policy.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify + Display,
    {
        self.run_with(self.config.retry, op).await
    }

    /// Run `op` under a per-call retry policy.
    pub async fn run_with<T, E, F, Fut>(&self, retry: RetryConfig, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify + Display,
    {
        if let Some(retry_after) = self.breaker.retry_after().await {
            telemetry::record_rejection();
            debug!(
                retry_after_ms = retry_after.as_millis() as u64,
                "breaker open, rejecting call"
            );
            return Err(GuardError::CircuitOpen { retry_after });
        }

        // A success restores `Active` only for a session obtained after the
        // latest forced sign-out
        let mut epoch = self.sign_outs.load(Ordering::Acquire);
        self.check_freshness(&retry).await?;

        let mut attempt: u32 = 0;
        loop {
            telemetry::record_attempt();
            let err = match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        self.emit(
                            &retry,
                            SessionEvent::new(
                                EventKind::Recovered,
                                format!("Operation succeeded after {attempt} retries"),
                                json!({ "retries": attempt }),
                            ),
                        );
                    }
                    self.breaker.reset().await;
                    self.auth_state.send_if_modified(|state| {
                        let restore = matches!(state, AuthState::SignedOut { .. })
                            && self.sign_outs.load(Ordering::Acquire) == epoch;
                        if restore {
                            *state = AuthState::Active;
                        }
                        restore
                    });
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = err.classify();
            let attempts = attempt + 1;

            if !class.is_retryable() || attempt >= retry.max_retries {
                self.emit(
                    &retry,
                    SessionEvent::new(
                        EventKind::PermanentFailure,
                        "Operation failed permanently",
                        json!({
                            "error": err.to_string(),
                            "attempts": attempts,
                            "class": class.label(),
                        }),
                    ),
                );
                if class == ErrorClass::Auth {
                    if let TripOutcome::Escalated { failing_for } = self.breaker.trip().await {
                        self.force_sign_out(failing_for).await;
                    }
                    return Err(GuardError::SessionExhausted {
                        message: format!("Operation failed after {attempts} attempts: {err}"),
                        attempts,
                    });
                }
                return Err(GuardError::Operation(err));
            }

            let delay = retry.backoff(attempt);
            self.emit(
                &retry,
                SessionEvent::new(
                    EventKind::RetryScheduled,
                    format!("Attempt {attempts} failed, retrying"),
                    json!({
                        "attempt": attempts,
                        "delay_ms": delay.as_millis() as u64,
                        "error": err.to_string(),
                        "class": class.label(),
                    }),
                ),
            );
            telemetry::record_retry();
            tokio::time::sleep(delay).await;

            epoch = self.sign_outs.load(Ordering::Acquire);
            self.check_freshness(&retry).await?;
            attempt += 1;
        }
    }

    async fn check_freshness(
        &self,
        retry: &RetryConfig,
    ) -> std::result::Result<Session, FreshnessError> {
        let result = self.freshness.ensure_fresh().await;
        if let Err(FreshnessError::RefreshFailed(reason)) = &result {
            self.emit(
                retry,
                SessionEvent::new(
                    EventKind::RefreshFailed,
                    "Session refresh failed",
                    json!({ "error": reason }),
                ),
            );
        }
        result
    }

    async fn force_sign_out(&self, failing_for: Duration) {
        error!(
            provider = self.auth.id(),
            failing_for_secs = failing_for.as_secs(),
            "session failures persisted past sign-out threshold, signing out"
        );
        if let Err(e) = self.auth.sign_out().await {
            warn!(error = %e, "sign-out failed, local session cleared anyway");
        }
        telemetry::record_forced_signout();

        // Always reported, regardless of the call's logging policy
        let event = SessionEvent::new(
            EventKind::ForcedSignOut,
            "Session failures persisted, signed out",
            json!({
                "failing_for_secs": failing_for.as_secs(),
                "reason": SIGN_OUT_REASON,
            }),
        );
        for sink in &self.sinks {
            sink.record(&event);
        }

        self.auth_state.send_modify(|state| {
            self.sign_outs.fetch_add(1, Ordering::AcqRel);
            *state = AuthState::SignedOut {
                reason: SIGN_OUT_REASON,
            };
        });
    }

    fn emit(&self, retry: &RetryConfig, event: SessionEvent) {
        if !retry.should_log {
            return;
        }
        for sink in &self.sinks {
            sink.record(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockAuth, RecordingSink};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    enum TestError {
        #[error("P0001")]
        Auth,
        #[error("request timed out")]
        Transient,
        #[error("duplicate key")]
        Fatal,
    }

    impl Classify for TestError {
        fn classify(&self) -> ErrorClass {
            match self {
                TestError::Auth => ErrorClass::Auth,
                TestError::Transient => ErrorClass::Transient,
                TestError::Fatal => ErrorClass::Fatal,
            }
        }
    }

    fn config(max_retries: u32) -> GuardConfig {
        GuardConfig {
            retry: RetryConfig::default()
                .with_max_retries(max_retries)
                .with_backoff(Duration::from_millis(100), Duration::from_millis(1000))
                .with_logging(true),
            ..GuardConfig::default()
        }
    }

    fn guard(auth: &Arc<MockAuth>, max_retries: u32) -> (SessionGuard, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let guard = SessionGuard::new(auth.clone(), config(max_retries)).with_sink(sink.clone());
        (guard, sink)
    }

    /// Operation that fails `failures` times with `err`, then returns its call count.
    fn scripted(
        calls: &Arc<AtomicUsize>,
        failures: usize,
        err: TestError,
    ) -> impl FnMut() -> std::future::Ready<std::result::Result<usize, TestError>> + use<> {
        let calls = calls.clone();
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= failures { Err(err) } else { Ok(n) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_try_success_is_silent_and_leaves_breaker_clean() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, sink) = guard(&auth, 3);
        let calls = Arc::new(AtomicUsize::new(0));

        let value = guard.run(scripted(&calls, 0, TestError::Auth)).await.unwrap();

        assert_eq!(value, 1);
        assert!(sink.kinds().is_empty());
        let snap = guard.breaker().snapshot().await;
        assert!(!snap.open);
        assert!(snap.failing_for.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_auth_failures_and_rechecks_session() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, sink) = guard(&auth, 3);
        let calls = Arc::new(AtomicUsize::new(0));

        // Each failure also expires the session so every retry must refresh
        let op = {
            let calls = calls.clone();
            let auth = auth.clone();
            move || {
                let calls = calls.clone();
                let auth = auth.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= 2 {
                        auth.expire().await;
                        Err(TestError::Auth)
                    } else {
                        Ok(n)
                    }
                }
            }
        };

        let value = guard.run(op).await.unwrap();
        assert_eq!(value, 3);
        assert_eq!(auth.refreshes(), 2);
        assert_eq!(
            sink.kinds(),
            vec![
                EventKind::RetryScheduled,
                EventKind::RetryScheduled,
                EventKind::Recovered
            ]
        );
        assert_eq!(
            sink.messages().last().map(String::as_str),
            Some("Operation succeeded after 2 retries")
        );
        assert!(!guard.breaker().is_open().await);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_auth_failures_open_breaker() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, sink) = guard(&auth, 2);
        let calls = Arc::new(AtomicUsize::new(0));

        let err = guard
            .run(scripted(&calls, usize::MAX, TestError::Auth))
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match &err {
            GuardError::SessionExhausted { message, attempts } => {
                assert_eq!(*attempts, 3);
                assert_eq!(message, "Operation failed after 3 attempts: P0001");
            }
            other => panic!("expected SessionExhausted, got {other:?}"),
        }
        assert_eq!(sink.kinds().last(), Some(&EventKind::PermanentFailure));
        assert!(guard.breaker().is_open().await);

        // The next call is rejected without touching the operation
        let blocked = Arc::new(AtomicUsize::new(0));
        let err = guard
            .run(scripted(&blocked, 0, TestError::Auth))
            .await
            .unwrap_err();
        match err {
            GuardError::CircuitOpen { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= guard.config().breaker_duration);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(blocked.load(Ordering::SeqCst), 0);
        assert_eq!(auth.sign_outs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_from_initial_delay() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, _sink) = guard(&auth, 3);
        let started = Arc::new(std::sync::Mutex::new(Vec::<Instant>::new()));

        let op = {
            let started = started.clone();
            move || {
                let mut started = started.lock().unwrap();
                started.push(Instant::now());
                let n = started.len();
                std::future::ready(if n <= 3 { Err(TestError::Auth) } else { Ok(n) })
            }
        };
        guard.run(op).await.unwrap();

        let started = started.lock().unwrap();
        let gaps: Vec<Duration> = started.windows(2).map(|w| w[1] - w[0]).collect();
        let expected = [100, 200, 400].map(Duration::from_millis);
        assert_eq!(gaps.len(), expected.len());
        for (gap, want) in gaps.iter().zip(expected) {
            assert!(
                *gap >= want && *gap < want + Duration::from_millis(5),
                "gap {gap:?}, expected {want:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn calls_run_again_after_cooldown() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, _sink) = guard(&auth, 0);
        let calls = Arc::new(AtomicUsize::new(0));

        guard
            .run(scripted(&calls, 1, TestError::Auth))
            .await
            .unwrap_err();
        assert!(guard.breaker().is_open().await);

        tokio::time::advance(guard.config().breaker_duration).await;
        assert!(!guard.breaker().is_open().await);

        let value = guard.run(scripted(&calls, 1, TestError::Auth)).await.unwrap();
        assert_eq!(value, 2);
        assert!(guard.breaker().snapshot().await.failing_for.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failures_force_one_sign_out() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, sink) = guard(&auth, 0);
        let mut state = guard.subscribe();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = guard
            .run(scripted(&calls, usize::MAX, TestError::Auth))
            .await
            .unwrap_err();
        assert!(matches!(first, GuardError::SessionExhausted { .. }));
        assert_eq!(auth.sign_outs(), 0);

        tokio::time::advance(guard.config().auto_signout_delay).await;

        let second = guard
            .run(scripted(&calls, usize::MAX, TestError::Auth))
            .await
            .unwrap_err();
        assert!(matches!(second, GuardError::SessionExhausted { .. }));
        assert_eq!(auth.sign_outs(), 1);
        assert!(sink.kinds().contains(&EventKind::ForcedSignOut));

        assert!(state.has_changed().unwrap());
        assert_eq!(
            *state.borrow_and_update(),
            AuthState::SignedOut { reason: "session" }
        );

        // Signed out: later calls fail on the missing session, no second sign-out
        tokio::time::advance(guard.config().breaker_duration).await;
        let third = guard
            .run(scripted(&calls, usize::MAX, TestError::Auth))
            .await
            .unwrap_err();
        assert!(matches!(third, GuardError::NoSession));
        assert_eq!(auth.sign_outs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_exhaustion_returns_original_error() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, _sink) = guard(&auth, 2);
        let calls = Arc::new(AtomicUsize::new(0));

        let err = guard
            .run(scripted(&calls, usize::MAX, TestError::Transient))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Operation(TestError::Transient)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!guard.breaker().is_open().await);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, sink) = guard(&auth, 3);
        let calls = Arc::new(AtomicUsize::new(0));

        let err = guard
            .run(scripted(&calls, usize::MAX, TestError::Fatal))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Operation(TestError::Fatal)));
        assert_eq!(err.to_string(), "duplicate key");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.kinds(), vec![EventKind::PermanentFailure]);
        assert!(!guard.breaker().is_open().await);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_means_one_attempt() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, _sink) = guard(&auth, 3);
        let calls = Arc::new(AtomicUsize::new(0));

        let retry = guard.config().retry.with_max_retries(0);
        let err = guard
            .run_with(retry, scripted(&calls, usize::MAX, TestError::Auth))
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_session_fails_before_operation() {
        let auth = Arc::new(MockAuth::new(None));
        let (guard, _sink) = guard(&auth, 3);
        let calls = Arc::new(AtomicUsize::new(0));

        let err = guard
            .run(scripted(&calls, 0, TestError::Auth))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::NoSession));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failure_between_attempts_abandons_retries() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, sink) = guard(&auth, 3);
        let calls = Arc::new(AtomicUsize::new(0));

        let op = {
            let calls = calls.clone();
            let auth = auth.clone();
            move || {
                let calls = calls.clone();
                let auth = auth.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    auth.expire().await;
                    auth.fail_refresh.store(true, Ordering::SeqCst);
                    Err::<(), _>(TestError::Auth)
                }
            }
        };

        let err = guard.run(op).await.unwrap_err();
        assert!(matches!(err, GuardError::RefreshFailed(_)), "got {err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sink.kinds(),
            vec![EventKind::RetryScheduled, EventKind::RefreshFailed]
        );
        // Abandoned before exhaustion: the breaker is not tripped
        assert!(!guard.breaker().is_open().await);
    }

    #[tokio::test(start_paused = true)]
    async fn logging_disabled_suppresses_events() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, sink) = guard(&auth, 3);
        let calls = Arc::new(AtomicUsize::new(0));

        let retry = guard.config().retry.with_logging(false);
        guard
            .run_with(retry, scripted(&calls, 2, TestError::Transient))
            .await
            .unwrap();
        assert!(sink.kinds().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_guarded_calls_share_one_refresh() {
        let auth = Arc::new(MockAuth::stale());
        let (guard, _sink) = guard(&auth, 3);
        let guard = Arc::new(guard);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .run(|| std::future::ready(Ok::<_, TestError>(())))
                    .await
                    .is_ok()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(auth.refreshes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_sign_out_restores_active_state() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, _sink) = guard(&auth, 0);
        let calls = Arc::new(AtomicUsize::new(0));

        guard
            .run(scripted(&calls, usize::MAX, TestError::Auth))
            .await
            .unwrap_err();
        tokio::time::advance(guard.config().auto_signout_delay).await;
        guard
            .run(scripted(&calls, usize::MAX, TestError::Auth))
            .await
            .unwrap_err();
        assert_eq!(guard.auth_state(), AuthState::SignedOut { reason: "session" });

        // The application signs back in
        auth.refresh_session().await.unwrap();
        tokio::time::advance(guard.config().breaker_duration).await;
        let ok = Arc::new(AtomicUsize::new(0));
        guard.run(scripted(&ok, 0, TestError::Auth)).await.unwrap();
        assert_eq!(guard.auth_state(), AuthState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn success_started_before_sign_out_keeps_signed_out_state() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, _sink) = guard(&auth, 0);
        let guard = Arc::new(guard);
        let calls = Arc::new(AtomicUsize::new(0));

        guard
            .run(scripted(&calls, usize::MAX, TestError::Auth))
            .await
            .unwrap_err();
        tokio::time::advance(guard.config().auto_signout_delay).await;

        // Slow call holding the pre-sign-out session
        let started = Arc::new(Notify::new());
        let slow = {
            let guard = guard.clone();
            let started = started.clone();
            tokio::spawn(async move {
                guard
                    .run(move || {
                        let started = started.clone();
                        async move {
                            started.notify_one();
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            Ok::<_, TestError>(())
                        }
                    })
                    .await
            })
        };
        started.notified().await;

        guard
            .run(scripted(&calls, usize::MAX, TestError::Auth))
            .await
            .unwrap_err();
        assert_eq!(auth.sign_outs(), 1);
        assert_eq!(guard.auth_state(), AuthState::SignedOut { reason: "session" });

        slow.await.unwrap().unwrap();
        assert_eq!(guard.auth_state(), AuthState::SignedOut { reason: "session" });
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_backoff_does_not_count_as_attempt() {
        let auth = Arc::new(MockAuth::fresh());
        let (guard, sink) = guard(&auth, 3);
        let calls = Arc::new(AtomicUsize::new(0));

        // Initial backoff is 100ms; drop the call halfway through it
        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            guard.run(scripted(&calls, usize::MAX, TestError::Auth)),
        )
        .await;
        assert!(outcome.is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snap = guard.breaker().snapshot().await;
        assert!(!snap.open);
        assert!(snap.failing_for.is_none());
        assert_eq!(sink.kinds(), vec![EventKind::RetryScheduled]);
    }
}
