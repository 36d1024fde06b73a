//! End-to-end delivery scenarios driven through the engine.
//!
//! Time is controlled with `TestClock`: each scenario processes one batch,
//! advances the clock to the next ready job and repeats, so retry delays are
//! observed exactly rather than waited out.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use courier_core::{
    ChannelEventHandler, DeliveryEvent, Destination, DestinationId, RetryPolicyOverrides,
    TestClock, WebhookPayload,
};
use courier_delivery::{
    dedup::DedupOptions, retry, CircuitConfig, CircuitState, DeliveryConfig, DeliveryEngine,
    InMemoryJobQueue, SubmitOptions,
};
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

struct Scenario {
    engine: DeliveryEngine,
    queue: InMemoryJobQueue,
    clock: TestClock,
    events: mpsc::Receiver<DeliveryEvent>,
}

impl Scenario {
    fn new(config: DeliveryConfig) -> Self {
        let clock = TestClock::new();
        let queue = InMemoryJobQueue::new(Arc::new(clock.clone()));
        let (handler, events) = ChannelEventHandler::new(256);
        let engine = DeliveryEngine::builder(config)
            .with_clock(Arc::new(clock.clone()))
            .with_queue(Arc::new(queue.clone()))
            .with_event_handler(Arc::new(handler))
            .build()
            .unwrap();

        Self { engine, queue, clock, events }
    }

    fn drain_events(&mut self) -> Vec<DeliveryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Processes batches until the queue is empty, advancing the clock to
    /// each retry.
    async fn run_to_completion(&mut self) {
        for _ in 0..32 {
            self.engine.process_batch().await.unwrap();
            match self.queue.next_ready_in() {
                Some(delay) => self.clock.advance(delay),
                None => return,
            }
        }
        unreachable!("queue did not drain");
    }
}

fn no_jitter() -> SubmitOptions {
    SubmitOptions::default()
        .with_retry_policy(RetryPolicyOverrides { jitter: Some(Duration::ZERO), ..Default::default() })
}

#[tokio::test]
async fn open_circuit_skips_request_and_waits_for_recovery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .expect(3)
        .mount(&server)
        .await;

    let mut scenario = Scenario::new(DeliveryConfig {
        circuit: CircuitConfig { failure_threshold: 3, ..CircuitConfig::default() },
        ..DeliveryConfig::default()
    });
    let destination = Destination::new("slow", server.uri());
    let destination_id = DestinationId::new("slow");
    let options = SubmitOptions::default().with_retry_policy(RetryPolicyOverrides {
        timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    });

    for id in 0..3 {
        scenario
            .engine
            .submit_delivery(destination.clone(), WebhookPayload::new("e", json!({"id": id})), options.clone())
            .await
            .unwrap();
    }
    assert_eq!(scenario.engine.process_batch().await.unwrap(), 3);
    assert_eq!(scenario.engine.circuit_state(&destination_id), CircuitState::Open);
    scenario.drain_events();

    let fourth = scenario
        .engine
        .submit_delivery(destination, WebhookPayload::new("e", json!({"id": 3})), options)
        .await
        .unwrap()
        .job_id()
        .unwrap();
    assert_eq!(scenario.engine.process_batch().await.unwrap(), 1);

    let scheduled: Vec<_> = scenario
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            DeliveryEvent::RetryScheduled(event) => Some(event),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled.len(), 1);
    assert!(scheduled[0].circuit_open);
    assert_eq!(scheduled[0].job_id, fourth);
    assert_eq!(scheduled[0].attempts_made, 1);
    assert_eq!(scheduled[0].delay_ms, 60_000);
    assert_eq!(scenario.queue.ready_in(fourth), Some(Duration::from_secs(60)));

    let metrics = scenario.engine.metrics(&destination_id).unwrap();
    assert_eq!(metrics.total_deliveries, 3);
    assert_eq!(metrics.circuit_rejections, 1);
}

#[tokio::test]
async fn not_found_is_dead_lettered_after_one_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let mut scenario = Scenario::new(DeliveryConfig::default());
    let destination_id = DestinationId::new("gone");
    scenario
        .engine
        .submit_delivery(
            Destination::new("gone", server.uri()),
            WebhookPayload::new("order.created", json!({"id": 1})),
            SubmitOptions::default(),
        )
        .await
        .unwrap();

    scenario.run_to_completion().await;

    let records = scenario.engine.dead_letters(&destination_id, 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job.attempts_made, 1);
    assert!(records[0].requires_manual_intervention);
    assert!(records[0].final_error.contains("404"));

    let events = scenario.drain_events();
    assert!(matches!(events[0], DeliveryEvent::AttemptFailed(ref failed) if !failed.is_retryable));
    assert!(matches!(events[1], DeliveryEvent::DeadLettered(_)));
    assert_eq!(events.len(), 2);
    assert_eq!(scenario.engine.pending_jobs().await.unwrap(), 0);
}

#[tokio::test]
async fn recovers_after_transient_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut scenario = Scenario::new(DeliveryConfig::default());
    scenario
        .engine
        .submit_delivery(
            Destination::new("flaky", server.uri()),
            WebhookPayload::new("order.created", json!({"id": 1})),
            no_jitter(),
        )
        .await
        .unwrap();

    scenario.run_to_completion().await;

    let events = scenario.drain_events();
    let delays: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            DeliveryEvent::RetryScheduled(event) => Some(event.delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![1_000, 2_000, 4_000]);

    let Some(DeliveryEvent::Succeeded(success)) = events.last() else {
        unreachable!("expected final success event");
    };
    assert_eq!(success.attempt_number, 4);
    assert_eq!(success.status_code, 200);

    let stats = scenario.engine.stats().await;
    assert_eq!(stats.successful_deliveries, 1);
    assert_eq!(stats.retries_scheduled, 3);
    assert_eq!(stats.dead_lettered, 0);
}

#[tokio::test]
async fn identical_submissions_within_window_deliver_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut scenario = Scenario::new(DeliveryConfig::default());
    let destination = Destination::new("orders", server.uri());
    let options = SubmitOptions::default()
        .with_deduplication(DedupOptions::default().with_window(Duration::from_millis(5_000)));

    let first = scenario
        .engine
        .submit_delivery(destination.clone(), WebhookPayload::new("order.created", json!({"id": 9})), options.clone())
        .await
        .unwrap();
    scenario.clock.advance(Duration::from_millis(4_000));
    let second = scenario
        .engine
        .submit_delivery(destination, WebhookPayload::new("order.created", json!({"id": 9})), options)
        .await
        .unwrap();

    assert!(!first.is_duplicate());
    assert!(second.is_duplicate());

    scenario.run_to_completion().await;
    let metrics = scenario.engine.metrics(&DestinationId::new("orders")).unwrap();
    assert_eq!(metrics.total_deliveries, 1);
    assert_eq!(metrics.duplicates_suppressed, 1);
}

#[tokio::test]
async fn attempts_never_exceed_budget_and_dead_letter_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let mut scenario = Scenario::new(DeliveryConfig::default());
    let options = SubmitOptions::default().with_retry_policy(RetryPolicyOverrides {
        max_attempts: Some(3),
        jitter: Some(Duration::ZERO),
        ..Default::default()
    });
    scenario
        .engine
        .submit_delivery(Destination::new("down", server.uri()), WebhookPayload::new("e", json!({})), options)
        .await
        .unwrap();

    scenario.run_to_completion().await;

    let events = scenario.drain_events();
    let dead_letters = events.iter().filter(|e| matches!(e, DeliveryEvent::DeadLettered(_))).count();
    let attempts = events.iter().filter(|e| matches!(e, DeliveryEvent::AttemptFailed(_))).count();
    assert_eq!(dead_letters, 1);
    assert_eq!(attempts, 3);

    let records = scenario.engine.dead_letters(&DestinationId::new("down"), 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job.attempts_made, 3);
    assert!(!records[0].requires_manual_intervention);
}

#[tokio::test]
async fn higher_priority_jobs_are_delivered_first() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let mut scenario = Scenario::new(DeliveryConfig { batch_size: 1, ..DeliveryConfig::default() });
    let destination = Destination::new("orders", server.uri());

    scenario
        .engine
        .submit_delivery(destination.clone(), WebhookPayload::new("low", json!({})), SubmitOptions::default())
        .await
        .unwrap();
    let urgent = scenario
        .engine
        .submit_delivery(
            destination,
            WebhookPayload::new("urgent", json!({})),
            SubmitOptions::default().with_priority(10),
        )
        .await
        .unwrap()
        .job_id()
        .unwrap();

    scenario.engine.process_batch().await.unwrap();

    let Some(DeliveryEvent::Succeeded(first)) = scenario.drain_events().into_iter().next() else {
        unreachable!("expected a delivery");
    };
    assert_eq!(first.job_id, urgent);
}

#[tokio::test]
async fn exponential_delay_is_lower_bound_of_scheduled_delay() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(502)).mount(&server).await;

    let mut scenario = Scenario::new(DeliveryConfig::default());
    let job_id = scenario
        .engine
        .submit_delivery(Destination::new("bad-gateway", server.uri()), WebhookPayload::new("e", json!({})), SubmitOptions::default())
        .await
        .unwrap()
        .job_id()
        .unwrap();

    scenario.engine.process_batch().await.unwrap();

    let policy = scenario.engine.config().default_retry_policy.clone();
    let ready_in = scenario.queue.ready_in(job_id).unwrap();
    assert!(ready_in >= retry::exponential_delay(&policy, 1));
    assert!(ready_in <= retry::exponential_delay(&policy, 1) + policy.jitter);
}
