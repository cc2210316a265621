//! Session guard gateway
//!
//! Single-binary Rust service that:
//! 1. Holds a backend session seeded from a refresh token
//! 2. Listens for incoming requests
//! 3. Forwards them to the backend through the session guard (freshness
//!    check, retry with backoff, circuit breaker, forced sign-out)
//! 4. Reports guard state on /health and metrics on /metrics

mod config;
mod error;
mod metrics;
mod proxy;

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;
use session_auth::{HttpAuthProvider, Session};
use session_guard::{AuthState, MetricsPoster, SessionGuard, TracingSink};

use crate::config::Config;
use crate::error::Error;
use crate::proxy::ProxyState;

/// Maximum time to wait for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest event name accepted on `POST /api/metrics`.
const MAX_EVENT_LEN: usize = 64;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/metrics", post(client_metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting session-guard-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let guard_config = config.guard.resolve().map_err(Error::from)?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        auth_url = %config.auth.url,
        headers = config.headers.len(),
        max_retries = guard_config.retry.max_retries,
        breaker_secs = guard_config.breaker_duration.as_secs(),
        auto_signout_secs = guard_config.auto_signout_delay.as_secs(),
        "configuration loaded"
    );

    let api_key = config.auth.api_key.clone().ok_or(Error::MissingApiKey)?;
    let refresh_token = config
        .auth
        .refresh_token
        .clone()
        .ok_or(Error::MissingRefreshToken)?;

    let client = reqwest::Client::new();
    let auth = Arc::new(HttpAuthProvider::new(
        client.clone(),
        config.auth.url.clone(),
        api_key,
    ));
    auth.set_session(Session::from_refresh_token(refresh_token))
        .await;

    let mut guard = SessionGuard::new(auth, guard_config).with_sink(Arc::new(TracingSink));
    if let Some(url) = &config.telemetry.metrics_url {
        info!(url = %url, "posting retry metrics");
        guard = guard.with_sink(Arc::new(MetricsPoster::new(client.clone(), url.clone())));
    }
    let guard = Arc::new(guard);

    // Exchange the refresh token now so a revoked token shows up at startup
    match guard.ensure_fresh().await {
        Ok(session) => info!(expires_at = session.expires_at, "initial session established"),
        Err(e) => warn!(error = %e, "initial session refresh failed, will retry per request"),
    }

    tokio::spawn(watch_auth_state(guard.subscribe()));

    let app_state = AppState {
        proxy: ProxyState {
            client,
            upstream_url: config.proxy.upstream_url.clone(),
            headers_to_inject: config.headers.clone(),
            timeout: Duration::from_secs(config.proxy.timeout_secs),
            guard,
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
        },
        started_at: Instant::now(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify the server to drain, then race it against the timer.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await?;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Log forced sign-outs as they happen.
async fn watch_auth_state(mut rx: watch::Receiver<AuthState>) {
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        match state {
            AuthState::SignedOut { reason } => {
                error!(reason, "session signed out by guard, re-authentication required")
            }
            AuthState::Active => info!("session active again"),
        }
    }
}

/// Health endpoint: JSON with guard state, uptime, and request counters.
///
/// 200 when healthy. 503 when the breaker is open (`degraded`) or the guard
/// has signed the session out (`signed_out`).
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let guard = &state.proxy.guard;
    let breaker = guard.breaker().snapshot().await;
    let auth_state = guard.auth_state();

    let (status_code, status, auth) = match auth_state {
        AuthState::SignedOut { .. } => (StatusCode::SERVICE_UNAVAILABLE, "signed_out", "signed_out"),
        AuthState::Active if breaker.open => (StatusCode::SERVICE_UNAVAILABLE, "degraded", "active"),
        AuthState::Active => (StatusCode::OK, "healthy", "active"),
    };

    let mut body = serde_json::json!({
        "status": status,
        "auth": auth,
        "breaker": {
            "open": breaker.open,
            "retry_after_seconds": breaker.retry_after.map(|d| d.as_secs()),
            "failing_for_seconds": breaker.failing_for.map(|d| d.as_secs()),
        },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "requests_served": state.proxy.requests_total.load(Ordering::Relaxed),
        "errors_total": state.proxy.errors_total.load(Ordering::Relaxed),
    });
    if let AuthState::SignedOut { reason } = auth_state {
        body["reason"] = serde_json::Value::from(reason);
    }

    (
        status_code,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Body of `POST /api/metrics`.
#[derive(Debug, Deserialize)]
struct ClientEvent {
    event: String,
}

/// Whether `event` is safe to use as a metric label value.
fn is_valid_event_name(event: &str) -> bool {
    !event.is_empty()
        && event.len() <= MAX_EVENT_LEN
        && event
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Client event ingest, e.g. `{"event":"session_retry"}` from retry posters.
async fn client_metrics_handler(Json(body): Json<ClientEvent>) -> Response {
    if !is_valid_event_name(&body.event) {
        return (
            StatusCode::BAD_REQUEST,
            [(CONTENT_TYPE, "application/json")],
            serde_json::json!({
                "error": {
                    "type": "invalid_request",
                    "message": "event must be 1-64 characters of [a-z0-9_]",
                }
            })
            .to_string(),
        )
            .into_response();
    }
    metrics::record_client_event(&body.event);
    StatusCode::NO_CONTENT.into_response()
}

/// Catch-all handler that proxies all other requests upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to install Ctrl+C handler")?;
                info!("received SIGINT, shutting down");
            }
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")?;
        info!("received SIGINT, shutting down");
    }

    Ok(())
}
