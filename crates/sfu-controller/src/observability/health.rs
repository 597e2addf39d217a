//! Health endpoints for the SFU controller.
//!
//! - `GET /health` - Liveness check (is the process running?)
//! - `GET /ready` - Readiness check (can we accept new signaling connections?)
//!
//! The `/metrics` endpoint is mounted next to these in `main.rs`.
//!
//! Readiness flips to true once the signaling listener is bound and back to
//! false as soon as shutdown begins, so load balancers stop routing new
//! clients while existing rooms drain.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
    draining: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live, not ready, not draining).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    /// Mark the service as draining. Readiness stays false from here on.
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.is_draining()
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Probe response body.
#[derive(Debug, Serialize)]
struct ProbeBody {
    status: &'static str,
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<ProbeBody>) {
    if state.is_live() {
        (StatusCode::OK, Json(ProbeBody { status: "alive" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeBody { status: "dead" }),
        )
    }
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ProbeBody>) {
    if state.is_ready() {
        (StatusCode::OK, Json(ProbeBody { status: "ready" }))
    } else if state.is_draining() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeBody { status: "draining" }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeBody {
                status: "starting",
            }),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn fetch(state: Arc<HealthState>, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");

        let response = health_router(state)
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready by default");
        assert!(!state.is_draining());
    }

    #[test]
    fn test_draining_overrides_ready() {
        let state = HealthState::new();
        state.set_ready();
        assert!(state.is_ready());

        state.set_draining();
        assert!(!state.is_ready());

        state.set_ready();
        assert!(!state.is_ready(), "Draining must keep readiness false");
    }

    #[tokio::test]
    async fn test_liveness_endpoint() {
        let (status, body) = fetch(Arc::new(HealthState::new()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "alive");
    }

    #[tokio::test]
    async fn test_readiness_endpoint_transitions() {
        let state = Arc::new(HealthState::new());

        let (status, body) = fetch(Arc::clone(&state), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "starting");

        state.set_ready();
        let (status, _) = fetch(Arc::clone(&state), "/ready").await;
        assert_eq!(status, StatusCode::OK);

        state.set_draining();
        let (status, body) = fetch(Arc::clone(&state), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "draining");
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let (status, _) = fetch(Arc::new(HealthState::new()), "/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
