//! HTTP-level coverage of the Axum router: round-trip laws and status codes
//! over `build_router`, driven with `tower::ServiceExt::oneshot` against
//! `wiremock`-stubbed backends rather than a bound TCP listener.

use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use relay_core::gateway::GatewayLimits;
use relay_core::health::HealthMonitorConfig;
use relay_core::ids::ProviderName;
use relay_core::provider::{BackendConfig, HttpBackendConfig, HttpDialect, ProviderDescriptor};
use relay_core::store::sqlite::SqliteStore;
use relay_core::worker::WorkerConfig;
use relay_core::Gateway;
use relay_gateway::api::build_router;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn openai_provider(name: &str, base_url: &str) -> ProviderDescriptor {
    ProviderDescriptor {
        name: ProviderName::from(name),
        enabled: true,
        priority: 0,
        backend: BackendConfig::HttpApi(HttpBackendConfig {
            api_base_url: base_url.to_string(),
            api_key_env: "UNUSED_TEST_KEY".to_string(),
            dialect: HttpDialect::Openai,
            extra_headers: Default::default(),
        }),
        default_model: Some("test-model".to_string()),
        concurrency: 4,
        timeout: Duration::from_secs(30),
        fallback_chain: Vec::new(),
        cost_per_1k: None,
        qps: None,
        cache_ttl_s: None,
    }
}

async fn build_app(server_uri: &str) -> axum::Router {
    let storage = Arc::new(SqliteStore::connect(":memory:").await.unwrap());
    let health_config = HealthMonitorConfig {
        interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let worker_config = WorkerConfig {
        claim_interval: Duration::from_millis(10),
        status_log_interval: None,
        ..Default::default()
    };
    let gateway = Gateway::new(storage, vec![openai_provider("p", server_uri)], GatewayLimits::default(), health_config, worker_config).unwrap();
    let gateway = Arc::new(gateway);
    gateway.spawn_background_tasks();
    build_router(gateway)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, body: Value) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder().method("GET").uri(uri).body(axum::body::Body::empty()).unwrap()
}

fn delete(uri: &str) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder().method("DELETE").uri(uri).body(axum::body::Body::empty()).unwrap()
}

#[tokio::test]
async fn ask_wait_true_returns_completed_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "hi"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
        })))
        .mount(&server)
        .await;

    let app = build_app(&server.uri()).await;
    let response = app
        .oneshot(post("/api/ask?wait=true", json!({"provider": "p", "message": "hello"})))
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["status"], json!("completed"));
    assert_eq!(body["data"]["response"], json!("hi"));
    assert_eq!(body["data"]["cached"], json!(false));
}

#[tokio::test]
async fn submit_then_query_returns_same_request_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "hi"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
        })))
        .mount(&server)
        .await;

    let app = build_app(&server.uri()).await;

    let submit_response = app.clone().oneshot(post("/api/submit", json!({"provider": "p", "message": "hello"}))).await.unwrap();
    assert_eq!(submit_response.status(), axum::http::StatusCode::ACCEPTED);
    let submit_body = body_json(submit_response).await;
    let request_id = submit_body["data"]["request_id"].as_str().unwrap().to_string();

    let query_response = app.oneshot(get(&format!("/api/query/{request_id}"))).await.unwrap();
    assert_eq!(query_response.status(), axum::http::StatusCode::OK);
    let query_body = body_json(query_response).await;
    assert_eq!(query_body["data"]["request_id"], json!(request_id));
}

#[tokio::test]
async fn submit_then_poll_matches_wait_true() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "hi"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
        })))
        .mount(&server)
        .await;

    let app = build_app(&server.uri()).await;

    let submit_response = app.clone().oneshot(post("/api/submit", json!({"provider": "p", "message": "hello"}))).await.unwrap();
    let submit_body = body_json(submit_response).await;
    let request_id = submit_body["data"]["request_id"].as_str().unwrap().to_string();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let query_response = app.clone().oneshot(get(&format!("/api/query/{request_id}"))).await.unwrap();
        let query_body = body_json(query_response).await;
        if query_body["data"]["status"] == json!("completed") {
            assert_eq!(query_body["data"]["response"], json!("hi"));
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "request never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn duplicate_ask_is_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "hi"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = build_app(&server.uri()).await;

    let first = app.clone().oneshot(post("/api/ask?wait=true", json!({"provider": "p", "message": "hello"}))).await.unwrap();
    assert_eq!(body_json(first).await["data"]["cached"], json!(false));

    let second = app.oneshot(post("/api/ask?wait=true", json!({"provider": "p", "message": "hello"}))).await.unwrap();
    let second_body = body_json(second).await;
    assert_eq!(second_body["data"]["cached"], json!(true));
    assert_eq!(second_body["data"]["response"], json!("hi"));

    server.verify().await;
}

#[tokio::test]
async fn ask_wait_true_times_out_with_504_when_backend_never_responds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "too slow"}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
        })).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let app = build_app(&server.uri()).await;
    let response = app
        .oneshot(post("/api/ask?wait=true&timeout=1", json!({"provider": "p", "message": "hello"})))
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::GATEWAY_TIMEOUT);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["error"]["code"], json!("wait_timeout"));
}

#[tokio::test]
async fn cancel_twice_returns_conflict_on_second_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "too slow"}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
        })).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let app = build_app(&server.uri()).await;
    let submit_response = app.clone().oneshot(post("/api/submit", json!({"provider": "p", "message": "hello"}))).await.unwrap();
    let submit_body = body_json(submit_response).await;
    let request_id = submit_body["data"]["request_id"].as_str().unwrap().to_string();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let query_response = app.clone().oneshot(get(&format!("/api/query/{request_id}"))).await.unwrap();
        let query_body = body_json(query_response).await;
        if query_body["data"]["status"] == json!("processing") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "request never reached processing");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let first_cancel = app.clone().oneshot(delete(&format!("/api/request/{request_id}"))).await.unwrap();
    assert_eq!(first_cancel.status(), axum::http::StatusCode::OK);

    let second_cancel = app.oneshot(delete(&format!("/api/request/{request_id}"))).await.unwrap();
    assert_eq!(second_cancel.status(), axum::http::StatusCode::CONFLICT);
}
