use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use lbpool::api::{build_router, ApiState};
use lbpool::balance::{BackendTarget, ClientSocketFactory, PoolConfig};
use lbpool::BackendGroup;
use std::sync::Arc;
use tower::util::ServiceExt;

fn group_with(backends: &[(&str, u16)]) -> Arc<BackendGroup> {
    let group = Arc::new(BackendGroup::new());
    for (id, port) in backends {
        let factory = ClientSocketFactory::new(
            BackendTarget::new("127.0.0.1", *port).with_ids("lbpool", *id),
            PoolConfig::default(),
        );
        factory.init().unwrap();
        group.insert(Arc::new(factory));
    }
    group
}

async fn get_json(state: ApiState, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = build_router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let group = group_with(&[("app-a", 6800), ("app-b", 6801)]);
    group.get("app-b").unwrap().stop();

    let (status, health) = get_json(ApiState::new(group), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["version"].is_string());
    assert_eq!(health["backends"], 2);
    assert_eq!(health["live_backends"], 1);
}

#[tokio::test]
async fn test_list_backends_sorted_by_id() {
    let group = group_with(&[("zeta", 6802), ("alpha", 6800)]);

    let (status, backends) = get_json(ApiState::new(group), "/api/backends").await;

    assert_eq!(status, StatusCode::OK);
    let backends = backends.as_array().unwrap();
    assert_eq!(backends.len(), 2);
    assert_eq!(backends[0]["id"], "alpha");
    assert_eq!(backends[1]["id"], "zeta");
    assert_eq!(backends[0]["state"], "STARTING");
    assert_eq!(backends[0]["debug_id"], "lbpool->alpha");
}

#[tokio::test]
async fn test_backend_detail() {
    let group = group_with(&[("app-a", 6800)]);
    let factory = group.get("app-a").unwrap();
    factory.fail_connect();

    let (status, backend) = get_json(ApiState::new(group), "/api/backends/app-a").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(backend["state"], "FAIL");
    assert_eq!(backend["port"], 6800);
    assert_eq!(backend["fail_count_total"], 1);
    assert_eq!(backend["dynamic_fail_recover_ms"], 2000);
    assert!(backend["last_fail_connect_time"].is_string());
    assert!(backend["last_success_time"].is_null());
}

#[tokio::test]
async fn test_unknown_backend_returns_404() {
    let group = group_with(&[("app-a", 6800)]);

    let (status, body) = get_json(ApiState::new(group), "/api/backends/missing").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let group = group_with(&[("app-a", 6800)]);
    group.get("app-a").unwrap().to_fail();

    let response = build_router(ApiState::new(group))
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("# TYPE lbpool_backend_live gauge"));
    assert!(text.contains("lbpool_backend_live{backend=\"app-a\",state=\"FAIL\"} 0"));
    assert!(text.contains("lbpool_backend_latency_factor{backend=\"app-a\"} 0"));
}

#[cfg(feature = "metrics")]
#[tokio::test]
async fn test_metrics_endpoint_includes_pool_counters() {
    use lbpool::balance::PrometheusMetrics;

    let metrics = Arc::new(PrometheusMetrics::new().unwrap());
    let group = Arc::new(BackendGroup::new());
    let factory = ClientSocketFactory::new(
        BackendTarget::new("127.0.0.1", 6800).with_ids("lbpool", "app-a"),
        PoolConfig::default(),
    )
    .with_metrics(metrics.clone());
    factory.init().unwrap();
    factory.fail_connect();
    group.insert(Arc::new(factory));

    let state = ApiState::new(group).with_metrics(metrics);
    let response = build_router(state)
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("lbpool_connect_failures_total{backend=\"app-a\"} 1"));
    assert!(text.contains("lbpool_backend_live"));
}
