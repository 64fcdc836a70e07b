/// Integration tests for the dashboard HTTP API and the profiling middleware
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    middleware::from_fn_with_state,
    routing::get as get_route,
    Extension, Router,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use profileboard::{
    config::{ProfilerConfig, ServerConfig},
    handlers::AppState,
    middleware::{profiling_middleware, CorrelationId},
    profiler::{Completion, Profiler, QueryRecord, RequestMetadata, SqliteProfileStore},
    server::create_router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn app(with_store: bool) -> (Router, Arc<Profiler>, Option<Arc<SqliteProfileStore>>) {
    let profiler = Profiler::init(ProfilerConfig::default(), None);
    let store = if with_store {
        Some(Arc::new(SqliteProfileStore::open("sqlite::memory:").await.unwrap()))
    } else {
        None
    };

    let state = AppState {
        profiler: profiler.clone(),
        store: store.clone(),
        metrics: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
    };

    (create_router(&ServerConfig::default(), state), profiler, store)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let (router, _profiler, _) = app(false).await;

    let (status, body) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["persistence"], false);
}

#[tokio::test]
async fn test_middleware_profiles_and_echoes_request_id() {
    let (router, profiler, _) = app(false).await;
    let mut feed = profiler.subscribe();

    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "trace-42")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.headers()["x-request-id"], "trace-42");

    let profile = feed.recv().await.unwrap();
    assert_eq!(profile.correlation_id, "trace-42");
    assert_eq!(profile.metadata.method, "GET");
    assert_eq!(profile.metadata.path, "/health");
    assert_eq!(profile.status_code, Some(200));
    assert_eq!(profiler.registry().active_count(), 0);
}

#[tokio::test]
async fn test_middleware_generates_request_id() {
    let (router, _profiler, _) = app(false).await;

    let response = router.clone().oneshot(get("/health")).await.unwrap();
    let id = response.headers()["x-request-id"].to_str().unwrap();
    assert_eq!(id.len(), 36);
}

#[tokio::test]
async fn test_colliding_request_id_gets_own_context() {
    let profiler = Profiler::init(ProfilerConfig::default(), None);
    let recorder = profiler.clone();
    let router = Router::new()
        .route(
            "/b",
            get_route(move |Extension(id): Extension<CorrelationId>| {
                let profiler = recorder.clone();
                async move {
                    profiler.on_query(id.as_str(), QueryRecord::new("SELECT * FROM b_only", "", 10));
                    "ok"
                }
            }),
        )
        .layer(from_fn_with_state(profiler.clone(), profiling_middleware));
    let mut feed = profiler.subscribe();

    // Request A is still in flight under the client-chosen id
    assert!(profiler.on_request_start("dup", RequestMetadata::new("GET", "/a")));

    let request = Request::builder()
        .uri("/b")
        .header("x-request-id", "dup")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    let used_id = response.headers()["x-request-id"].to_str().unwrap().to_string();
    assert_ne!(used_id, "dup");

    let b = feed.recv().await.unwrap();
    assert_eq!(b.correlation_id, used_id);
    assert_eq!(b.metadata.path, "/b");
    assert_eq!(b.queries.len(), 1);

    let a = profiler.on_request_end("dup", Completion::with_status(200)).unwrap();
    assert_eq!(a.metadata.path, "/a");
    assert!(a.queries.is_empty());

    profiler.shutdown().await;
}

#[tokio::test]
async fn test_monitor_routes_are_not_profiled() {
    let (router, profiler, _) = app(false).await;

    let (status, _) = send(&router, get("/__monitor__/profiler")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profiler.stats().publisher.published, 0);
}

#[tokio::test]
async fn test_toggle_profiler() {
    let (router, profiler, _) = app(false).await;

    let (status, body) = send(&router, get("/__monitor__/profiler")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"enabled": true}));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/__monitor__/profiler")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"enabled": false}"#))
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"enabled": false}));
    assert!(!profiler.is_enabled());

    // Disabled: requests pass through unprofiled
    send(&router, get("/health")).await;
    assert_eq!(profiler.stats().publisher.published, 0);
}

#[tokio::test]
async fn test_history_without_store_is_unavailable() {
    let (router, _profiler, _) = app(false).await;

    let (status, body) = send(&router, get("/__monitor__/profiles")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["type"], "store_unavailable");

    let (status, body) = send(&router, get("/__monitor__/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("total_requests").is_none());
    assert_eq!(body["profiler"]["enabled"], true);
}

#[tokio::test]
async fn test_history_endpoints() {
    let (router, profiler, store) = app(true).await;
    let store = store.unwrap();

    profiler.on_request_start("ok-1", RequestMetadata::new("GET", "/items"));
    profiler.on_query("ok-1", QueryRecord::new("SELECT * FROM items", "", 120));
    let ok = profiler.on_request_end("ok-1", Completion::with_status(200)).unwrap();

    profiler.on_request_start("err-1", RequestMetadata::new("POST", "/items"));
    let err = profiler.on_request_end("err-1", Completion::with_status(500)).unwrap();

    store.insert_batch(&[ok, err]).await.unwrap();

    let (status, body) = send(&router, get("/__monitor__/profiles")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);

    let (_, body) = send(&router, get("/__monitor__/profiles?status=error")).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["profiles"][0]["correlation_id"], "err-1");

    let (status, body) = send(&router, get("/__monitor__/profiles/ok-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queries"][0]["text"], "select * from items");

    let (status, _) = send(&router, get("/__monitor__/profiles/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&router, get("/__monitor__/profiles?limit=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(&router, get("/__monitor__/export")).await;
    assert_eq!(body.as_array().map(Vec::len), Some(2));

    let (_, body) = send(&router, get("/__monitor__/stats")).await;
    assert_eq!(body["total_requests"], 2);
    assert_eq!(body["error_count"], 1);
}

#[tokio::test]
async fn test_stream_is_event_stream() {
    let (router, _profiler, _) = app(false).await;

    let response = router.clone().oneshot(get("/__monitor__/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
}
