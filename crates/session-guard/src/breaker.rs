//! Circuit breaker with escalating auto sign-out
//!
//! Closed until an auth-failure exhaustion trips it, then open for the
//! cool-down window. There is no timer task: every query checks the deadline
//! and closes the breaker once it has passed.
//!
//! `first_failure_at` survives cool-downs. Only a clean success or the
//! escalation itself clears it, so repeated trip/cool-down cycles without a
//! success accumulate toward the forced sign-out.
//!
//! Transitions:
//! - Closed → Open (trip)
//! - Open → Closed (cool-down elapsed, observed lazily)
//! - Open/Closed → Closed + failure history cleared (clean success)

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::telemetry;

/// Result of a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripOutcome {
    /// Breaker opened; failures are still within the escalation window
    Tripped,
    /// Breaker opened and failures have persisted past the sign-out threshold
    Escalated { failing_for: Duration },
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub open: bool,
    /// Remaining cool-down when open
    pub retry_after: Option<Duration>,
    /// Age of the oldest unresolved failure
    pub failing_for: Option<Duration>,
}

#[derive(Debug, Default)]
struct BreakerState {
    tripped_until: Option<Instant>,
    first_failure_at: Option<Instant>,
}

/// Shared breaker state. One instance per guard, shared by reference.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    breaker_duration: Duration,
    auto_signout_delay: Duration,
}

impl CircuitBreaker {
    pub fn new(breaker_duration: Duration, auto_signout_delay: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
            breaker_duration,
            auto_signout_delay,
        }
    }

    /// Whether calls are currently rejected. Closes an expired breaker.
    pub async fn is_open(&self) -> bool {
        self.retry_after().await.is_some()
    }

    /// Remaining cool-down, or `None` when closed. Closes an expired breaker.
    pub async fn retry_after(&self) -> Option<Duration> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.tripped_until {
            Some(until) if now < until => Some(until - now),
            Some(_) => {
                state.tripped_until = None;
                telemetry::set_breaker_open(false);
                info!("breaker cool-down elapsed, closing");
                None
            }
            None => None,
        }
    }

    /// Open the breaker for one cool-down window.
    ///
    /// Records the first failure time if none is set. If the oldest failure
    /// is at least `auto_signout_delay` old, returns `Escalated` and clears
    /// the failure history so the escalation fires once per episode.
    pub async fn trip(&self) -> TripOutcome {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.tripped_until = Some(now + self.breaker_duration);
        telemetry::record_trip();
        telemetry::set_breaker_open(true);

        let outcome = match state.first_failure_at {
            None => {
                state.first_failure_at = Some(now);
                TripOutcome::Tripped
            }
            Some(first) => {
                let failing_for = now - first;
                if failing_for >= self.auto_signout_delay {
                    state.first_failure_at = None;
                    TripOutcome::Escalated { failing_for }
                } else {
                    TripOutcome::Tripped
                }
            }
        };

        match outcome {
            TripOutcome::Tripped => warn!(
                cooldown_secs = self.breaker_duration.as_secs(),
                "breaker tripped"
            ),
            TripOutcome::Escalated { failing_for } => warn!(
                cooldown_secs = self.breaker_duration.as_secs(),
                failing_for_secs = failing_for.as_secs(),
                "breaker tripped, failures outlived sign-out threshold"
            ),
        }
        outcome
    }

    /// Clear all bookkeeping after a clean success. No-op when already clean.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if state.tripped_until.is_none() && state.first_failure_at.is_none() {
            return;
        }
        state.tripped_until = None;
        state.first_failure_at = None;
        telemetry::set_breaker_open(false);
        debug!("breaker reset after successful operation");
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let retry_after = self.retry_after().await;
        let state = self.state.lock().await;
        let now = Instant::now();
        BreakerSnapshot {
            open: retry_after.is_some(),
            retry_after,
            failing_for: state.first_failure_at.map(|first| now - first),
        }
    }

    pub fn breaker_duration(&self) -> Duration {
        self.breaker_duration
    }
}
