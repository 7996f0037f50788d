use crate::api::types::{ErrorResponse, HealthResponse};
use crate::balance::{BackendGroup, FactorySnapshot};
use crate::utils::error::Result;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::balance::PrometheusMetrics;

#[derive(Clone)]
pub struct ApiState {
    pub group: Arc<BackendGroup>,
    pub started_at: Instant,
    #[cfg(feature = "metrics")]
    pub metrics: Option<Arc<PrometheusMetrics>>,
}

impl ApiState {
    pub fn new(group: Arc<BackendGroup>) -> Self {
        Self {
            group,
            started_at: Instant::now(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<PrometheusMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// GET /health - liveness and backend availability
pub async fn health_check(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let factories = state.group.factories();
    let live = factories.iter().filter(|f| f.is_active()).count();

    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        backends: factories.len(),
        live_backends: live,
    };

    (StatusCode::OK, Json(response))
}

/// GET /api/backends - statistics for every backend pool
pub async fn list_backends(State(state): State<ApiState>) -> Json<Vec<FactorySnapshot>> {
    Json(state.group.snapshots())
}

/// GET /api/backends/{id} - statistics for one backend pool
pub async fn get_backend(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<FactorySnapshot>, (StatusCode, Json<ErrorResponse>)> {
    match state.group.get(&id) {
        Some(factory) => Ok(Json(factory.snapshot())),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("unknown backend: {}", id),
            }),
        )),
    }
}

/// GET /metrics - Prometheus text format
pub async fn get_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let mut body = match registry_text(&state) {
        Some(Ok(text)) => text,
        Some(Err(e)) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
                e.to_string(),
            )
        }
        None => String::new(),
    };
    body.push_str(&render_snapshots(&state.group.snapshots()));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        body,
    )
}

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[cfg(feature = "metrics")]
fn registry_text(state: &ApiState) -> Option<Result<String>> {
    state.metrics.as_ref().map(|metrics| metrics.render())
}

#[cfg(not(feature = "metrics"))]
fn registry_text(_state: &ApiState) -> Option<Result<String>> {
    None
}

/// Per-backend state gauges derived from snapshots.
fn render_snapshots(snapshots: &[FactorySnapshot]) -> String {
    let mut out = String::from(
        "# HELP lbpool_backend_live Backend accepts new connections (1) or not (0)\n\
         # TYPE lbpool_backend_live gauge\n",
    );
    for s in snapshots {
        let _ = writeln!(
            out,
            "lbpool_backend_live{{backend=\"{}\",state=\"{}\"}} {}",
            s.id,
            s.state,
            u8::from(s.state.is_live())
        );
    }

    out.push_str(
        "# HELP lbpool_backend_latency_factor Smoothed latency between successes in ms\n\
         # TYPE lbpool_backend_latency_factor gauge\n",
    );
    for s in snapshots {
        let _ = writeln!(
            out,
            "lbpool_backend_latency_factor{{backend=\"{}\"}} {}",
            s.id, s.latency_factor
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{BackendTarget, ClientSocketFactory, PoolConfig};

    fn state_with_backend() -> ApiState {
        let group = Arc::new(BackendGroup::new());
        let factory = ClientSocketFactory::new(
            BackendTarget::new("127.0.0.1", 6800).with_ids("lbpool", "app-a"),
            PoolConfig::default(),
        );
        factory.init().unwrap();
        group.insert(Arc::new(factory));
        ApiState::new(group)
    }

    #[tokio::test]
    async fn health_counts_live_backends() {
        let (status, Json(health)) = health_check(State(state_with_backend())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health.backends, 1);
        assert_eq!(health.live_backends, 1);
    }

    #[tokio::test]
    async fn unknown_backend_is_not_found() {
        let err = get_backend(State(state_with_backend()), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn snapshot_gauges_include_state() {
        let state = state_with_backend();
        let text = render_snapshots(&state.group.snapshots());
        assert!(text.contains("lbpool_backend_live{backend=\"app-a\",state=\"STARTING\"} 1"));
    }
}
