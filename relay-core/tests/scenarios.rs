//! End-to-end scenarios against the full `Gateway` (real priority queue, worker
//! pool, executor, cache, event bus) with stubbed HTTP backends via `wiremock`.
//! No HTTP layer here — `relay-gateway`'s own tests cover the Axum surface;
//! these exercise the orchestration core the way `relay-gateway` calls into it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use relay_core::events::{Channel, Event};
use relay_core::executor::RetryConfig;
use relay_core::gateway::{GatewayLimits, IntakeOutcome, SubmitRequest};
use relay_core::health::HealthMonitorConfig;
use relay_core::ids::{ProviderName, RequestId};
use relay_core::provider::{BackendConfig, HttpBackendConfig, HttpDialect, ProviderDescriptor};
use relay_core::request::{RequestRecord, RequestStatus};
use relay_core::response::Response;
use relay_core::store::sqlite::SqliteStore;
use relay_core::worker::WorkerConfig;
use relay_core::{Gateway, RelayError};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn openai_provider(name: &str, base_url: &str, fallback_chain: Vec<&str>, concurrency: usize) -> ProviderDescriptor {
    ProviderDescriptor {
        name: ProviderName::from(name),
        enabled: true,
        priority: 0,
        backend: BackendConfig::HttpApi(HttpBackendConfig {
            api_base_url: base_url.to_string(),
            api_key_env: format!("UNUSED_{}_KEY", name.to_uppercase()),
            dialect: HttpDialect::Openai,
            extra_headers: Default::default(),
        }),
        default_model: Some("test-model".to_string()),
        concurrency,
        timeout: Duration::from_secs(30),
        fallback_chain: fallback_chain.into_iter().map(ProviderName::from).collect(),
        cost_per_1k: None,
        qps: None,
        cache_ttl_s: None,
    }
}

async fn build_gateway(providers: Vec<ProviderDescriptor>, retry: RetryConfig) -> Arc<Gateway> {
    let storage = Arc::new(SqliteStore::connect(":memory:").await.unwrap());
    let health_config = HealthMonitorConfig {
        interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let worker_config = WorkerConfig {
        claim_interval: Duration::from_millis(10),
        status_log_interval: None,
        retry,
        ..Default::default()
    };
    let gateway = Gateway::new(storage, providers, GatewayLimits::default(), health_config, worker_config).unwrap();
    let gateway = Arc::new(gateway);
    gateway.spawn_background_tasks();
    gateway
}

async fn enqueue(gateway: &Gateway, provider: &str, message: &str, priority: i64) -> RequestId {
    match gateway
        .intake(SubmitRequest {
            provider: provider.to_string(),
            model: None,
            agent: None,
            message: message.to_string(),
            priority: Some(priority),
            bypass_cache: false,
            api_key_id: None,
            timeout: None,
        })
        .await
        .unwrap()
    {
        IntakeOutcome::Enqueued(id) => id,
        IntakeOutcome::CachedHit(_) => panic!("expected a fresh enqueue, got a cache hit"),
        IntakeOutcome::JoinedInFlight(..) => panic!("expected a fresh enqueue, got a single-flight join"),
    }
}

async fn wait_for_terminal(gateway: &Gateway, id: RequestId, timeout: Duration) -> (RequestRecord, Option<Response>) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (record, response) = gateway.query(id).await.unwrap();
        if record.status.is_terminal() {
            return (record, response);
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("request {id} did not reach a terminal state within {timeout:?}, last status {:?}", record.status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn openai_success_body(text: &str) -> serde_json::Value {
    json!({
        "choices": [{"message": {"content": text}}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
    })
}

#[tokio::test]
async fn s1_simple_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body("hi")))
        .mount(&server)
        .await;

    let gateway = build_gateway(vec![openai_provider("p", &server.uri(), vec![], 4)], RetryConfig::default()).await;

    let id = enqueue(&gateway, "p", "hello", 0).await;
    let (record, response) = wait_for_terminal(&gateway, id, Duration::from_secs(5)).await;

    assert_eq!(record.status, RequestStatus::Completed);
    let response = response.expect("a completed request always has a response row");
    assert_eq!(response.text.as_deref(), Some("hi"));
    assert_eq!(response.tokens.total, 4);
    assert!(!response.cached);
}

#[tokio::test]
async fn s2_cache_hit_invokes_backend_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body("hi")))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = build_gateway(vec![openai_provider("p", &server.uri(), vec![], 4)], RetryConfig::default()).await;

    let id1 = enqueue(&gateway, "p", "hello", 0).await;
    let (record1, response1) = wait_for_terminal(&gateway, id1, Duration::from_secs(5)).await;
    assert_eq!(record1.status, RequestStatus::Completed);
    assert!(!response1.unwrap().cached);

    // Identical body, submitted only once the first has already completed and
    // populated the cache: the second call must be served from the cache without
    // a second backend invocation.
    let outcome = gateway
        .intake(SubmitRequest {
            provider: "p".to_string(),
            model: None,
            agent: None,
            message: "hello".to_string(),
            priority: None,
            bypass_cache: false,
            api_key_id: None,
            timeout: None,
        })
        .await
        .unwrap();

    let IntakeOutcome::CachedHit(response2) = outcome else {
        panic!("expected a cache hit on the identical second submission");
    };
    assert_eq!(response2.text.as_deref(), Some("hi"));
    assert!(response2.cached);

    // `server`'s mock has `.expect(1)`; this assertion runs on drop via wiremock's
    // verification, but double-check explicitly too.
    server.verify().await;
}

#[tokio::test]
async fn s3_fallback_to_second_provider() {
    let p1_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&p1_server)
        .await;

    let p2_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body("from p2")))
        .mount(&p2_server)
        .await;

    let providers = vec![
        openai_provider("p1", &p1_server.uri(), vec!["p2"], 4),
        openai_provider("p2", &p2_server.uri(), vec![], 4),
    ];
    let retry = RetryConfig {
        max_attempts: 1,
        base_backoff: Duration::from_millis(5),
        jitter_fraction: 0.1,
    };
    let gateway = build_gateway(providers, retry).await;

    let (_sub_id, mut events) = gateway.subscribe(HashSet::from([Channel::Cli]));
    let id = enqueue(&gateway, "p1", "x", 0).await;
    let (record, response) = wait_for_terminal(&gateway, id, Duration::from_secs(5)).await;

    assert_eq!(record.status, RequestStatus::Completed);
    let response = response.unwrap();
    assert_eq!(response.text.as_deref(), Some("from p2"));
    assert_eq!(response.provider_used.as_deref(), Some("p2"));

    let mut saw_p1 = false;
    let mut saw_p2 = false;
    while let Ok(event) = events.try_recv() {
        if let Event::ProviderInvoked { request_id, provider, .. } = event {
            if request_id == id {
                saw_p1 |= provider == "p1";
                saw_p2 |= provider == "p2";
            }
        }
    }
    assert!(saw_p1 && saw_p2, "expected provider-invoked events for both p1 and p2");
}

#[tokio::test]
async fn s4_retry_then_give_up() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/")).respond_with(ResponseTemplate::new(502)).mount(&server).await;

    let retry = RetryConfig {
        max_attempts: 3,
        base_backoff: Duration::from_millis(5),
        jitter_fraction: 0.1,
    };
    let gateway = build_gateway(vec![openai_provider("p", &server.uri(), vec![], 4)], retry).await;

    let id = enqueue(&gateway, "p", "x", 0).await;
    let (record, response) = wait_for_terminal(&gateway, id, Duration::from_secs(5)).await;

    assert_eq!(record.status, RequestStatus::Failed);
    let response = response.unwrap();
    assert_eq!(response.error_code, Some("transient_backend"));
    assert_eq!(record.attempt_count, 3, "attempt count should reflect all three in-process retries, not just the one worker claim");
}

#[tokio::test]
async fn s5_priority_jumps_the_line() {
    let server = MockServer::start().await;
    // The first matched call is held open briefly so the remaining nine
    // priority-1 requests and the later priority-100 request are all queued
    // before anything else dispatches; every call after that responds immediately.
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body("ok")).set_delay(Duration::from_millis(300)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body("ok")))
        .mount(&server)
        .await;

    // Concurrency cap of 1 forces strict one-at-a-time dispatch for this provider.
    let gateway = build_gateway(vec![openai_provider("p", &server.uri(), vec![], 1)], RetryConfig::default()).await;

    let (_sub_id, mut events) = gateway.subscribe(HashSet::from([Channel::Cli]));

    let mut low_priority_ids = Vec::new();
    for i in 0..10 {
        low_priority_ids.push(enqueue(&gateway, "p", &format!("low-{i}"), 1).await);
    }
    let high_priority_id = enqueue(&gateway, "p", "high", 100).await;

    // Collect dispatch order via ProviderInvoked events (attempt == 1 per request
    // since nothing here retries).
    let mut order = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while order.len() < 2 && tokio::time::Instant::now() < deadline {
        let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await else {
            continue;
        };
        if let Event::ProviderInvoked { request_id, .. } = event {
            order.push(request_id);
        }
    }

    assert!(order.len() >= 2, "expected at least two dispatches to observe ordering, saw {}", order.len());
    assert!(low_priority_ids.contains(&order[0]), "first dispatch is the request already in flight when priority-100 arrived");
    assert_eq!(order[1], high_priority_id, "the priority-100 request must be the second dispatched, ahead of the other nine priority-1 requests still queued");

    // Drain: everything eventually completes.
    for id in low_priority_ids.into_iter().chain(std::iter::once(high_priority_id)) {
        wait_for_terminal(&gateway, id, Duration::from_secs(5)).await;
    }
}

#[tokio::test]
async fn s6_cancel_mid_flight_then_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body("too slow")).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let gateway = build_gateway(vec![openai_provider("p", &server.uri(), vec![], 4)], RetryConfig::default()).await;

    let id = enqueue(&gateway, "p", "x", 0).await;

    // Wait for the worker to actually claim it before cancelling, matching the
    // scenario's "while status is processing" precondition.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (record, _) = gateway.query(id).await.unwrap();
        if record.status == RequestStatus::Processing {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "request never reached processing");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let cancelled = gateway.cancel(id).await.unwrap();
    assert_eq!(cancelled.status, RequestStatus::Cancelled);

    let (record, _) = wait_for_terminal(&gateway, id, Duration::from_secs(2)).await;
    assert_eq!(record.status, RequestStatus::Cancelled);

    let second_cancel = gateway.cancel(id).await;
    assert!(matches!(second_cancel, Err(RelayError::Conflict { .. })), "cancelling an already-terminal request must return a conflict");
}

#[tokio::test]
async fn round_trip_submit_then_query_same_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body("hi")))
        .mount(&server)
        .await;

    let gateway = build_gateway(vec![openai_provider("p", &server.uri(), vec![], 4)], RetryConfig::default()).await;
    let id = enqueue(&gateway, "p", "hello", 0).await;
    let (record, _) = gateway.query(id).await.unwrap();
    assert_eq!(record.id, id);
}
