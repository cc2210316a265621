//! Session resilience guard
//!
//! Wraps remote operations against a backend that can fail on expired
//! credentials, flaky networks, or outages. Three cooperating parts:
//!
//! - `FreshnessChecker`: refreshes a near-expiry session, with at most one
//!   refresh in flight no matter how many callers need it
//! - `SessionGuard`: classifies failures and retries with capped exponential
//!   backoff, re-checking freshness before every retry
//! - `CircuitBreaker`: opens after auth-failure exhaustion and fails calls fast
//!   for a cool-down window; failures persisting across trips force a sign-out
//!
//! Call flow: caller → `SessionGuard::run` → freshness check → operation →
//! classify → retry or give up → breaker transition → typed `GuardError`.

pub mod breaker;
pub mod classify;
pub mod config;
pub mod error;
pub mod freshness;
pub mod guard;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use breaker::{BreakerSnapshot, CircuitBreaker, TripOutcome};
pub use classify::{Classify, ErrorClass};
pub use config::{GuardConfig, GuardSettings, RetryConfig};
pub use error::{FreshnessError, GuardError, Result};
pub use freshness::FreshnessChecker;
pub use guard::{AuthState, SessionGuard};
pub use telemetry::{MetricsPoster, SessionEvent, TelemetrySink, TracingSink};
