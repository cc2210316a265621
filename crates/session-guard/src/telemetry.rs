//! Structured session telemetry
//!
//! The guard reports retries, recoveries, and give-ups as `SessionEvent`s to
//! any number of `TelemetrySink`s. Sinks are fire-and-forget: `record` is
//! synchronous and must never fail the guarded call. Counters and the breaker
//! gauge go through the `metrics` facade regardless of sinks.

use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Event category shared by every guard event.
pub const CATEGORY: &str = "session";

/// Payload posted by `MetricsPoster` for each retry.
pub const RETRY_METRIC_EVENT: &str = "session_retry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An operation succeeded after at least one retry
    Recovered,
    /// An attempt failed and another one is scheduled
    RetryScheduled,
    /// The guard stopped retrying
    PermanentFailure,
    /// The freshness check before a retry failed
    RefreshFailed,
    /// Failures outlived the escalation threshold and the session was revoked
    ForcedSignOut,
}

impl EventKind {
    pub fn label(self) -> &'static str {
        match self {
            EventKind::Recovered => "recovered",
            EventKind::RetryScheduled => "retry_scheduled",
            EventKind::PermanentFailure => "permanent_failure",
            EventKind::RefreshFailed => "refresh_failed",
            EventKind::ForcedSignOut => "forced_sign_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub category: &'static str,
    pub kind: EventKind,
    pub message: String,
    pub data: serde_json::Value,
    pub level: EventLevel,
}

impl SessionEvent {
    pub fn new(kind: EventKind, message: impl Into<String>, data: serde_json::Value) -> Self {
        let level = match kind {
            EventKind::Recovered => EventLevel::Info,
            EventKind::RetryScheduled => EventLevel::Debug,
            EventKind::PermanentFailure | EventKind::RefreshFailed => EventLevel::Warning,
            EventKind::ForcedSignOut => EventLevel::Error,
        };
        Self {
            category: CATEGORY,
            kind,
            message: message.into(),
            data,
            level,
        }
    }
}

/// Consumer of guard events.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &SessionEvent);
}

/// Writes each event to `tracing` at the event's level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, event: &SessionEvent) {
        let kind = event.kind.label();
        match event.level {
            EventLevel::Debug => {
                debug!(category = event.category, kind, data = %event.data, "{}", event.message)
            }
            EventLevel::Info => {
                info!(category = event.category, kind, data = %event.data, "{}", event.message)
            }
            EventLevel::Warning => {
                warn!(category = event.category, kind, data = %event.data, "{}", event.message)
            }
            EventLevel::Error => {
                error!(category = event.category, kind, data = %event.data, "{}", event.message)
            }
        }
    }
}

/// Best-effort `POST {"event":"session_retry"}` for every retry event.
///
/// The request runs on a spawned task; a failed post is logged and dropped.
/// Outside a tokio runtime the post is skipped.
#[derive(Debug, Clone)]
pub struct MetricsPoster {
    client: reqwest::Client,
    url: String,
}

impl MetricsPoster {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl TelemetrySink for MetricsPoster {
    fn record(&self, event: &SessionEvent) {
        if event.kind != EventKind::RetryScheduled {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime available, skipping retry metric post");
            return;
        };

        let client = self.client.clone();
        let url = self.url.clone();
        handle.spawn(async move {
            let result = client
                .post(&url)
                .json(&serde_json::json!({ "event": RETRY_METRIC_EVENT }))
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!(status = %resp.status(), url = %url, "retry metric post rejected"),
                Err(e) => warn!(error = %e, url = %url, "failed to post retry metric"),
            }
        });
    }
}

pub(crate) fn record_attempt() {
    metrics::counter!("session_guard_attempts_total").increment(1);
}

pub(crate) fn record_retry() {
    metrics::counter!("session_guard_retries_total").increment(1);
}

pub(crate) fn record_refresh(outcome: &'static str) {
    metrics::counter!("session_guard_refreshes_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_trip() {
    metrics::counter!("session_guard_breaker_trips_total").increment(1);
}

pub(crate) fn record_rejection() {
    metrics::counter!("session_guard_breaker_rejections_total").increment(1);
}

pub(crate) fn record_forced_signout() {
    metrics::counter!("session_guard_forced_signouts_total").increment(1);
}

pub(crate) fn set_breaker_open(open: bool) {
    metrics::gauge!("session_guard_breaker_open").set(if open { 1.0 } else { 0.0 });
}
