use crate::api::handlers::{get_backend, get_metrics, health_check, list_backends, ApiState};
use crate::config::ApiSettings;
use crate::utils::error::Result;
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/backends", get(list_backends))
        .route("/api/backends/{id}", get(get_backend))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the monitoring API and serve it in the background.
pub async fn start_api_server(settings: &ApiSettings, state: ApiState) -> Result<JoinHandle<()>> {
    let bind_addr = format!("{}:{}", settings.bind_address, settings.bind_port);
    let listener = TcpListener::bind(&bind_addr).await?;
    let local_addr = listener.local_addr()?;

    let router = build_router(state);

    info!("Monitoring API listening on http://{}", local_addr);

    let server = axum::serve(listener, router.into_make_service());

    let handle = tokio::spawn(async move {
        if let Err(err) = server.await {
            error!("Monitoring API error: {}", err);
        }
    });

    Ok(handle)
}
