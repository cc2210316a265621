//! Guarded HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop headers, injects configured
//! headers and the session's bearer token, and forwards to the upstream
//! backend through `SessionGuard::run`. Every attempt re-reads the session, so
//! a retry after a refresh carries the new token.
//!
//! Upstream responses the guard classifies as fatal (2xx, most 4xx) are
//! returned verbatim. Session failures and 5xx are retried and surface as
//! `session_exhausted` once the budget runs out; while the breaker is open
//! every request fails fast with `circuit_open`.

use crate::config::HeaderInjection;
use crate::metrics;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use session_guard::{Classify, ErrorClass, GuardError, SessionGuard};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, instrument, warn};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub headers_to_inject: Vec<HeaderInjection>,
    pub timeout: Duration,
    pub guard: Arc<SessionGuard>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// Upstream response handed back to the client unchanged.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Failure of a single forwarding attempt.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Upstream answered with a retryable status
    #[error("upstream returned {}", .response.status)]
    Status {
        response: UpstreamResponse,
        class: ErrorClass,
    },

    #[error("upstream timeout: {0}")]
    Timeout(String),

    #[error("upstream connection failed: {0}")]
    Connect(String),

    #[error("upstream error: {0}")]
    Other(String),

    /// Session vanished after the freshness check; the request is not sent
    #[error("no session to authorize upstream request")]
    Unauthenticated,
}

impl Classify for UpstreamError {
    fn classify(&self) -> ErrorClass {
        match self {
            UpstreamError::Status { class, .. } => *class,
            UpstreamError::Timeout(_) | UpstreamError::Connect(_) => ErrorClass::Transient,
            UpstreamError::Other(_) | UpstreamError::Unauthenticated => ErrorClass::Fatal,
        }
    }
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, error_type: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

/// Whole seconds until the breaker closes, never below 1.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

/// Proxy an inbound request to upstream under the session guard.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    let method = request.method().clone();
    let upstream_url = match request.uri().path_and_query() {
        Some(pq) => format!("{}{}", state.upstream_url.trim_end_matches('/'), pq),
        None => state.upstream_url.clone(),
    };
    let headers = outbound_headers(request.headers(), &state.headers_to_inject);

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let outcome = state
        .guard
        .run(|| forward_once(state, &method, &upstream_url, &headers, &body))
        .await;

    let response = match outcome {
        Ok(upstream) => upstream_into_response(upstream, &request_id),
        Err(err) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            guard_error_response(err, &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Inbound headers minus hop-by-hop and `authorization`, plus injections.
fn outbound_headers(inbound: &HeaderMap, injections: &[HeaderInjection]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if !is_hop_by_hop(name.as_str()) && name != AUTHORIZATION {
            headers.insert(name.clone(), value.clone());
        }
    }

    // Add if not present, replace if present
    for injection in injections {
        let name = match HeaderName::from_str(&injection.name) {
            Ok(n) => n,
            Err(e) => {
                warn!(header = %injection.name, error = %e, "skipping invalid header name");
                continue;
            }
        };
        let value = match HeaderValue::from_str(&injection.value) {
            Ok(v) => v,
            Err(e) => {
                warn!(header = %injection.name, error = %e, "skipping invalid header value");
                continue;
            }
        };
        headers.insert(name, value);
    }
    headers
}

/// One attempt: attach the current bearer token, send, classify the response.
async fn forward_once(
    state: &ProxyState,
    method: &Method,
    url: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<UpstreamResponse, UpstreamError> {
    let Some(session) = state.guard.auth().current_session().await else {
        warn!("session gone before forwarding, not sending unauthenticated request");
        return Err(UpstreamError::Unauthenticated);
    };
    let bearer = format!("Bearer {}", session.access_token.expose());
    let mut value = HeaderValue::from_str(&bearer).map_err(|e| {
        UpstreamError::Other(format!("access token is not a valid header value: {e}"))
    })?;
    value.set_sensitive(true);

    let mut headers = headers.clone();
    headers.insert(AUTHORIZATION, value);

    let result = state
        .client
        .request(method.clone(), url)
        .headers(headers)
        .timeout(state.timeout)
        .body(body.clone())
        .send()
        .await;

    let upstream = match result {
        Ok(resp) => resp,
        Err(e) if e.is_timeout() => return Err(UpstreamError::Timeout(e.to_string())),
        Err(e) if e.is_connect() => return Err(UpstreamError::Connect(e.to_string())),
        Err(e) => return Err(UpstreamError::Other(e.to_string())),
    };

    let status = upstream.status();
    let resp_headers = upstream.headers().clone();
    let resp_body = match upstream.bytes().await {
        Ok(b) => b,
        Err(e) if e.is_timeout() => return Err(UpstreamError::Timeout(e.to_string())),
        Err(e) => {
            return Err(UpstreamError::Other(format!(
                "upstream response read error: {e}"
            )));
        }
    };

    let response = UpstreamResponse {
        status,
        headers: resp_headers,
        body: resp_body,
    };
    if status.is_success() {
        return Ok(response);
    }

    let class = session_guard::classify::classify_response(
        status.as_u16(),
        &String::from_utf8_lossy(&response.body),
    );
    match class {
        ErrorClass::Fatal => Ok(response),
        class => Err(UpstreamError::Status { response, class }),
    }
}

fn upstream_into_response(upstream: UpstreamResponse, request_id: &str) -> Response {
    let mut response = Response::builder().status(upstream.status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .body(axum::body::Body::from(upstream.body))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

/// Map a guard failure onto the client-facing response.
fn guard_error_response(err: GuardError<UpstreamError>, request_id: &str) -> Response {
    metrics::record_guard_error(match &err {
        GuardError::Operation(UpstreamError::Status { .. }) => "upstream_status",
        GuardError::Operation(UpstreamError::Timeout(_)) => "timeout",
        GuardError::Operation(UpstreamError::Connect(_)) => "connection",
        GuardError::Operation(UpstreamError::Other(_)) => "upstream_other",
        GuardError::Operation(UpstreamError::Unauthenticated) => "no_session",
        other => other.kind(),
    });

    match err {
        GuardError::CircuitOpen { retry_after } => {
            let secs = retry_after_secs(retry_after);
            let mut response = error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "circuit_open",
                &format!("backend temporarily unavailable, retry in {secs}s"),
                request_id,
            );
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
            response
        }
        GuardError::SessionExhausted { message, attempts } => {
            warn!(attempts, "guard gave up on request");
            let body = serde_json::json!({
                "error": {
                    "type": "session_exhausted",
                    "message": message,
                    "attempts": attempts,
                    "request_id": request_id,
                }
            });
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [(CONTENT_TYPE, "application/json")],
                body.to_string(),
            )
                .into_response()
        }
        err @ (GuardError::NoSession | GuardError::RefreshFailed(_)) => error_response(
            StatusCode::UNAUTHORIZED,
            err.kind(),
            &err.to_string(),
            request_id,
        ),
        GuardError::Operation(e @ UpstreamError::Unauthenticated) => error_response(
            StatusCode::UNAUTHORIZED,
            "no_session",
            &e.to_string(),
            request_id,
        ),
        // Transient statuses (408, 429) that outlasted the retry budget pass through
        GuardError::Operation(UpstreamError::Status { response, .. }) => {
            upstream_into_response(response, request_id)
        }
        GuardError::Operation(e @ UpstreamError::Timeout(_)) => {
            error!(error = %e, "upstream timeout after all retries");
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "proxy_error",
                &e.to_string(),
                request_id,
            )
        }
        GuardError::Operation(e) => {
            error!(error = %e, "upstream request failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                "proxy_error",
                &e.to_string(),
                request_id,
            )
        }
    }
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
