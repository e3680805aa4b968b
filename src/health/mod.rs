//! The metrics/health HTTP surface (spec §4.8, "External surface"). The
//! teacher never serves HTTP itself, so this is grounded on
//! `examples/seanchatmangpt-knhk`'s `rest_api.rs`/`api/rest/server.rs` --
//! the only repo in the pack that stands up an `axum` server (`Router`,
//! `TcpListener::bind`, `axum::serve`) -- generalized from a workflow REST
//! API to confd's four fixed routes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared state the run loop updates after every backend health probe and
/// every resource cycle; the HTTP handlers only ever read it (spec §4.8:
/// `/health`, `/ready`, `/ready/detailed`, `/metrics`).
#[derive(Default)]
struct Inner {
    started: AtomicBool,
    last_healthy: AtomicBool,
    last_message: std::sync::Mutex<String>,
    last_duration: std::sync::Mutex<Duration>,
    templates_loaded: AtomicU64,
    template_cache_hits: AtomicU64,
}

#[derive(Clone, Default)]
pub struct HealthState {
    inner: Arc<Inner>,
}

impl HealthState {
    pub fn new() -> Self {
        HealthState::default()
    }

    /// Marks the process as past start-up; `/health` returns 200 only after
    /// this (spec §4.8: "always returns ok, HTTP 200, once the process is
    /// past start-up").
    pub fn mark_started(&self) {
        self.inner.started.store(true, Ordering::Relaxed);
    }

    /// Records the outcome of the most recent backend health check (spec
    /// §4.8: `/ready` is "200 iff the last backend health check passed").
    pub fn record_health_check(&self, healthy: bool, message: impl Into<String>, duration: Duration) {
        self.inner.last_healthy.store(healthy, Ordering::Relaxed);
        *self.inner.last_message.lock().unwrap() = message.into();
        *self.inner.last_duration.lock().unwrap() = duration;
    }

    pub fn set_templates_loaded(&self, count: usize) {
        self.inner.templates_loaded.store(count as u64, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.inner.template_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Total template cache hits recorded so far (spec §4.8,
    /// `confd_template_cache_hits_total`); exposed for cross-module tests
    /// that can't reach the private `/metrics` handler directly.
    pub fn cache_hits(&self) -> u64 {
        self.inner.template_cache_hits.load(Ordering::Relaxed)
    }
}

#[derive(Serialize)]
struct ReadyDetail {
    healthy: bool,
    message: String,
    duration_ms: u128,
    details: serde_json::Value,
}

async fn health_handler(State(state): State<HealthState>) -> (StatusCode, &'static str) {
    if state.inner.started.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

async fn ready_handler(State(state): State<HealthState>) -> StatusCode {
    if state.inner.last_healthy.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn ready_detailed_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let healthy = state.inner.last_healthy.load(Ordering::Relaxed);
    let message = state.inner.last_message.lock().unwrap().clone();
    let duration = *state.inner.last_duration.lock().unwrap();
    let body = ReadyDetail {
        healthy,
        message,
        duration_ms: duration.as_millis(),
        details: serde_json::json!({ "templates_loaded": state.inner.templates_loaded.load(Ordering::Relaxed) }),
    };
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}

async fn metrics_handler(State(state): State<HealthState>) -> String {
    let templates_loaded = state.inner.templates_loaded.load(Ordering::Relaxed);
    let backend_healthy = if state.inner.last_healthy.load(Ordering::Relaxed) { 1 } else { 0 };
    let cache_hits = state.inner.template_cache_hits.load(Ordering::Relaxed);

    let mut out = String::new();
    out.push_str("# HELP confd_templates_loaded Number of template resources currently loaded\n");
    out.push_str("# TYPE confd_templates_loaded gauge\n");
    out.push_str(&format!("confd_templates_loaded {templates_loaded}\n"));
    out.push_str("# HELP confd_backend_healthy Whether the last backend health check passed\n");
    out.push_str("# TYPE confd_backend_healthy gauge\n");
    out.push_str(&format!("confd_backend_healthy {backend_healthy}\n"));
    out.push_str("# HELP confd_template_cache_hits_total Total template cache hits across renders\n");
    out.push_str("# TYPE confd_template_cache_hits_total counter\n");
    out.push_str(&format!("confd_template_cache_hits_total {cache_hits}\n"));
    out
}

fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/ready/detailed", get(ready_detailed_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serves the health/metrics surface on `addr` until `ctx` is cancelled
/// (spec §4.8: brought up only "if a metrics/health address is configured").
pub async fn serve(addr: &str, state: HealthState, ctx: CancellationToken) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "metrics/health endpoint listening");
    info!("  GET /health - liveness, always ok once started");
    info!("  GET /ready - 200 iff the last backend health check passed");
    info!("  GET /ready/detailed - JSON health detail");
    info!("  GET /metrics - Prometheus text exposition");

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { ctx.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_returns_ok_once_started() {
        let state = HealthState::new();
        assert_eq!(health_handler(State(state.clone())).await.0, StatusCode::SERVICE_UNAVAILABLE);
        state.mark_started();
        assert_eq!(health_handler(State(state)).await, (StatusCode::OK, "ok"));
    }

    #[tokio::test]
    async fn test_ready_reflects_last_health_check() {
        let state = HealthState::new();
        assert_eq!(ready_handler(State(state.clone())).await, StatusCode::SERVICE_UNAVAILABLE);
        state.record_health_check(true, "ok", Duration::from_millis(5));
        assert_eq!(ready_handler(State(state)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_includes_required_series() {
        let state = HealthState::new();
        state.set_templates_loaded(3);
        state.record_cache_hit();
        let body = metrics_handler(State(state)).await;
        assert!(body.contains("confd_templates_loaded 3"));
        assert!(body.contains("confd_backend_healthy 0"));
        assert!(body.contains("confd_template_cache_hits_total 1"));
    }

    #[tokio::test]
    async fn test_mark_started_is_idempotent() {
        let state = HealthState::new();
        state.mark_started();
        state.mark_started();
        assert!(state.inner.started.load(Ordering::Relaxed));
    }
}
