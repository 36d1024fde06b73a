//! Integration tests for the delivery executor.
//!
//! Exercises the receiver wire contract, timeout handling, error
//! classification and circuit breaker bookkeeping against a mock receiver.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use courier_core::{
    Clock, Destination, DestinationId, RetryPolicy, SignatureAlgorithm, SignatureConfig,
    SignatureEncoding, TestClock, WebhookPayload,
};
use courier_delivery::{
    circuit::{CircuitBreakerRegistry, CircuitConfig, CircuitState},
    client::{ClientConfig, DeliveryExecutor},
    error::{DeliveryError, ErrorCategory},
    metrics::MetricsAggregator,
    signature,
};
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn executor(clock: &TestClock, circuit: CircuitConfig) -> DeliveryExecutor {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    DeliveryExecutor::new(
        ClientConfig::default(),
        CircuitBreakerRegistry::new(circuit, clock.clone()),
        MetricsAggregator::new(clock.clone()),
        clock,
    )
    .unwrap()
}

fn policy_with_timeout(timeout: Duration) -> RetryPolicy {
    RetryPolicy { timeout, ..RetryPolicy::default() }
}

#[tokio::test]
async fn sends_signed_canonical_body_with_delivery_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("content-type", "application/json"))
        .and(header("x-event", "order.created"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let clock = TestClock::new();
    let executor = executor(&clock, CircuitConfig::default());
    let destination = Destination::new("orders", format!("{}/hook", server.uri()))
        .with_secret("whsec_test")
        .with_header("Authorization", "Bearer token")
        .with_header("X-Signature", "forged");
    let payload = WebhookPayload::new("order.created", json!({"total": 10, "id": 1}));
    let correlation_id = Uuid::new_v4();

    let outcome = executor
        .execute(&destination, &payload, correlation_id, 1, &RetryPolicy::default())
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.status_code, Some(200));
    assert_eq!(outcome.response_body.as_deref(), Some("ok"));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    let header_str = |name: &str| request.headers.get(name).unwrap().to_str().unwrap().to_string();

    assert_eq!(header_str("x-delivery-id"), outcome.delivery_id.to_string());
    assert_eq!(header_str("x-correlation-id"), correlation_id.to_string());
    assert_eq!(header_str("authorization"), "Bearer token");

    let timestamp: u64 = header_str("x-timestamp").parse().unwrap();
    assert_eq!(timestamp, clock.unix_millis());

    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["event"], "order.created");
    assert_eq!(body["id"], payload.id.to_string());
    assert_eq!(String::from_utf8(request.body.clone()).unwrap(), signature::canonical_payload(&payload).unwrap());

    let signature_header = header_str("x-signature");
    assert_ne!(signature_header, "forged");
    signature::verify("whsec_test", timestamp, &request.body, &signature_header, SignatureConfig::default())
        .unwrap();
}

#[tokio::test]
async fn honors_destination_signature_config() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let clock = TestClock::new();
    let executor = executor(&clock, CircuitConfig::default());
    let config =
        SignatureConfig { algorithm: SignatureAlgorithm::Sha512, encoding: SignatureEncoding::Base64 };
    let destination = Destination::new("billing", server.uri()).with_secret("k").with_signature(config);
    let payload = WebhookPayload::new("invoice.paid", json!({"amount": 5}));

    let outcome = executor.execute(&destination, &payload, Uuid::new_v4(), 1, &RetryPolicy::default()).await;
    assert!(outcome.success);

    let request = &server.received_requests().await.unwrap()[0];
    let signature_header = request.headers.get("x-signature").unwrap().to_str().unwrap();
    assert!(signature_header.starts_with("sha512="));
    signature::verify("k", clock.unix_millis(), &request.body, signature_header, config).unwrap();
}

#[tokio::test]
async fn unsigned_destination_sends_no_signature() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let executor = executor(&TestClock::new(), CircuitConfig::default());
    let destination = Destination::new("open", server.uri());
    let payload = WebhookPayload::new("ping", json!({}));

    executor.execute(&destination, &payload, Uuid::new_v4(), 1, &RetryPolicy::default()).await;

    let request = &server.received_requests().await.unwrap()[0];
    assert!(request.headers.get("x-signature").is_none());
}

#[tokio::test]
async fn classifies_status_codes() {
    let cases = [
        (404, ErrorCategory::PermanentClient, false),
        (400, ErrorCategory::PermanentClient, false),
        (408, ErrorCategory::TransientServer, true),
        (429, ErrorCategory::TransientServer, true),
        (500, ErrorCategory::TransientServer, true),
        (503, ErrorCategory::TransientServer, true),
    ];

    for (status, category, retryable) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;

        let executor = executor(&TestClock::new(), CircuitConfig::default());
        let destination = Destination::new("d", server.uri());
        let outcome = executor
            .execute(&destination, &WebhookPayload::new("e", json!({})), Uuid::new_v4(), 1, &RetryPolicy::default())
            .await;

        assert!(!outcome.success, "status {status}");
        assert_eq!(outcome.status_code, Some(status));
        assert_eq!(outcome.category(), Some(category), "status {status}");
        assert_eq!(outcome.retryable, retryable, "status {status}");
    }
}

#[tokio::test]
async fn policy_status_overrides_change_retryability() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(409)).mount(&server).await;

    let executor = executor(&TestClock::new(), CircuitConfig::default());
    let destination = Destination::new("d", server.uri());
    let policy = RetryPolicy { retry_on_status: [409].into_iter().collect(), ..RetryPolicy::default() };

    let outcome =
        executor.execute(&destination, &WebhookPayload::new("e", json!({})), Uuid::new_v4(), 1, &policy).await;

    assert!(outcome.retryable);
}

#[tokio::test]
async fn slow_receiver_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let clock = TestClock::new();
    let executor = executor(&clock, CircuitConfig::default());
    let destination = Destination::new("slow", server.uri());
    let policy = policy_with_timeout(Duration::from_millis(100));

    let outcome =
        executor.execute(&destination, &WebhookPayload::new("e", json!({})), Uuid::new_v4(), 1, &policy).await;

    assert!(!outcome.success);
    assert!(outcome.status_code.is_none());
    assert!(matches!(outcome.error, Some(DeliveryError::Timeout { timeout_ms: 100 })));
    assert_eq!(outcome.category(), Some(ErrorCategory::TransientNetwork));
    assert!(outcome.retryable);
}

#[tokio::test]
async fn unreachable_receiver_is_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let uri = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let executor = executor(&TestClock::new(), CircuitConfig::default());
    let destination = Destination::new("gone", uri);
    let outcome = executor
        .execute(&destination, &WebhookPayload::new("e", json!({})), Uuid::new_v4(), 1, &RetryPolicy::default())
        .await;

    assert!(matches!(outcome.error, Some(DeliveryError::NetworkError { .. })));
    assert!(outcome.retryable);
}

#[tokio::test]
async fn failures_open_circuit_and_skip_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let clock = TestClock::new();
    let circuit = CircuitConfig { failure_threshold: 3, ..CircuitConfig::default() };
    let executor = executor(&clock, circuit);
    let destination = Destination::new("flaky", server.uri());
    let payload = WebhookPayload::new("e", json!({}));

    for attempt in 1..=3 {
        let outcome =
            executor.execute(&destination, &payload, Uuid::new_v4(), attempt, &RetryPolicy::default()).await;
        assert_eq!(outcome.status_code, Some(503));
    }

    let destination_id = DestinationId::new("flaky");
    let breaker = executor.circuits().get(&destination_id).unwrap();
    assert_eq!(breaker.current_state(), CircuitState::Open);

    let rejected = executor.execute(&destination, &payload, Uuid::new_v4(), 4, &RetryPolicy::default()).await;
    assert!(rejected.was_circuit_rejected());
    assert!(rejected.retryable);
    let Some(DeliveryError::CircuitOpen { retry_after, .. }) = rejected.error else {
        unreachable!("expected circuit open error");
    };
    assert_eq!(retry_after, breaker.next_attempt_delay());

    let metrics = executor.metrics().snapshot(&destination_id).unwrap();
    assert_eq!(metrics.total_deliveries, 3);
    assert_eq!(metrics.failed_deliveries, 3);
    assert_eq!(metrics.circuit_rejections, 1);
}

#[tokio::test]
async fn recovered_circuit_closes_after_probe_successes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let clock = TestClock::new();
    let circuit = CircuitConfig {
        failure_threshold: 2,
        recovery_timeout: Duration::from_secs(10),
        half_open_max_calls: 2,
    };
    let executor = executor(&clock, circuit);
    let destination = Destination::new("recovering", server.uri());
    let payload = WebhookPayload::new("e", json!({}));
    let policy = RetryPolicy::default();

    for attempt in 1..=2 {
        executor.execute(&destination, &payload, Uuid::new_v4(), attempt, &policy).await;
    }
    let destination_id = DestinationId::new("recovering");
    assert_eq!(executor.circuits().get(&destination_id).unwrap().current_state(), CircuitState::Open);

    clock.advance(Duration::from_secs(10));

    let first_probe = executor.execute(&destination, &payload, Uuid::new_v4(), 3, &policy).await;
    assert!(first_probe.success);
    assert_eq!(
        executor.circuits().get(&destination_id).unwrap().current_state(),
        CircuitState::HalfOpen
    );

    let second_probe = executor.execute(&destination, &payload, Uuid::new_v4(), 4, &policy).await;
    assert!(second_probe.success);
    assert_eq!(
        executor.circuits().get(&destination_id).unwrap().current_state(),
        CircuitState::Closed
    );
}
