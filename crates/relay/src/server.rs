use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use relay_latency::LatencyRegistry;

use crate::metrics::{Metrics, StatsSource};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub connected: bool,
    pub clients: usize,
}

/// Shared state for health endpoints
#[derive(Clone)]
pub struct ServerState {
    pub stats: Arc<dyn StatsSource>,
    pub metrics: Arc<Metrics>,
    pub latency: Arc<LatencyRegistry>,
}

impl ServerState {
    pub fn new(stats: Arc<dyn StatsSource>, metrics: Arc<Metrics>, latency: Arc<LatencyRegistry>) -> Self {
        Self {
            stats,
            metrics,
            latency,
        }
    }
}

/// Health endpoint - always returns 200 if server is running
async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    let stats = state.stats.relay_stats();
    Json(HealthResponse {
        status: "ok".to_string(),
        connected: stats.upstream_connected,
        clients: stats.connections,
    })
}

/// Ready endpoint - returns 200 only when the upstream stream is connected
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    let stats = state.stats.relay_stats();
    let connected = stats.upstream_connected;
    let status_code = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if connected { "ready" } else { "not_ready" }.to_string(),
            connected,
            clients: stats.connections,
        }),
    )
}

async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    state.metrics.update(&state.stats.relay_stats());
    match state.metrics.encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn latency(State(state): State<ServerState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        state.latency.to_csv(),
    )
}

/// Create the health server router
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/latency", get(latency))
        .with_state(state)
}

/// Run the health server until `shutdown` resolves
pub async fn run_server(
    listener: TcpListener,
    state: ServerState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "health/metrics server listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RelayStats;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    struct FixedStats(RelayStats);

    impl StatsSource for FixedStats {
        fn relay_stats(&self) -> RelayStats {
            self.0
        }
    }

    fn create_test_state(connected: bool) -> ServerState {
        let mut stats = RelayStats {
            upstream_connected: connected,
            connections: 2,
            ..Default::default()
        };
        stats.dispatcher.dispatched = 7;
        let latency = Arc::new(LatencyRegistry::new());
        latency.tracker("cache.orderbook_fetch").record_ns(1_000);
        ServerState::new(
            Arc::new(FixedStats(stats)),
            Arc::new(Metrics::new().unwrap()),
            latency,
        )
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_returns_ok() {
        let (status, body) = get_body(create_router(create_test_state(false)), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["clients"], 2);
    }

    #[tokio::test]
    async fn test_ready_when_connected() {
        let (status, _) = get_body(create_router(create_test_state(true)), "/ready").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_when_disconnected() {
        let (status, _) = get_body(create_router(create_test_state(false)), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (status, body) = get_body(create_router(create_test_state(true)), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("relay_dispatch_events_total{outcome=\"dispatched\"} 7"));
        assert!(body.contains("relay_upstream_connected 1"));
    }

    #[tokio::test]
    async fn test_latency_csv_endpoint() {
        let (status, body) = get_body(create_router(create_test_state(true)), "/latency").await;
        assert_eq!(status, StatusCode::OK);
        let mut lines = body.lines();
        assert_eq!(lines.next(), Some(relay_latency::CSV_HEADER));
        assert!(lines.next().unwrap().starts_with("cache.orderbook_fetch,1,1000,1000,"));
    }
}
