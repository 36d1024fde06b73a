//! Lifecycle events and the handler interface for downstream collaborators.
//!
//! The delivery engine never talks to alerting or destination management
//! directly. Every notable transition is published as a [`DeliveryEvent`]
//! through an [`EventHandler`], and whoever cares subscribes.
//!
//! # Event Flow
//!
//! ```text
//! ┌─────────────────┐  Succeeded / AttemptFailed  ┌───────────────────┐
//! │ Retry Scheduler │ ───────────────────────────▶│                   │
//! └─────────────────┘      RetryScheduled         │  EventHandler     │
//!                                                 │  (no-op, channel, │
//! ┌─────────────────┐  DeadLettered               │   multicast)      │
//! │ Dead Letter     │ ───────────────────────────▶│                   │
//! │ Handler         │  AutoDisableCandidate       └───────────────────┘
//! └─────────────────┘                                      │
//!                                                          ▼
//!                                               alerting / auto-disable
//! ```
//!
//! Handlers must not block delivery. The channel handler drops events when
//! its buffer is full and logs a warning instead of applying backpressure to
//! workers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::{DeliveryJob, DestinationId, JobId};

/// Events emitted by the delivery subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// A job was delivered with a 2xx response.
    Succeeded(DeliverySucceededEvent),

    /// A single attempt failed; the job may still be retried.
    AttemptFailed(DeliveryFailedEvent),

    /// A failed job was re-enqueued with a delay.
    RetryScheduled(RetryScheduledEvent),

    /// A job failed permanently and was persisted as a dead letter.
    DeadLettered(DeadLetterEvent),

    /// A destination accumulated enough permanent failures to be considered
    /// for disabling.
    AutoDisableCandidate(AutoDisableCandidateEvent),
}

impl DeliveryEvent {
    /// Destination the event refers to.
    pub fn destination_id(&self) -> &DestinationId {
        match self {
            Self::Succeeded(event) => &event.destination_id,
            Self::AttemptFailed(event) => &event.destination_id,
            Self::RetryScheduled(event) => &event.destination_id,
            Self::DeadLettered(event) => &event.destination_id,
            Self::AutoDisableCandidate(event) => &event.destination_id,
        }
    }

    /// Short stable name, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Succeeded(_) => "succeeded",
            Self::AttemptFailed(_) => "attempt_failed",
            Self::RetryScheduled(_) => "retry_scheduled",
            Self::DeadLettered(_) => "dead_lettered",
            Self::AutoDisableCandidate(_) => "auto_disable_candidate",
        }
    }
}

/// Emitted when a delivery succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySucceededEvent {
    /// Job that was delivered.
    pub job_id: JobId,

    /// Destination that accepted the delivery.
    pub destination_id: DestinationId,

    /// Id sent in `X-Delivery-Id` for the successful attempt.
    pub delivery_id: Uuid,

    /// Correlation id of the job.
    pub correlation_id: Uuid,

    /// HTTP status returned by the receiver.
    pub status_code: u16,

    /// Attempt number that succeeded (1-based).
    pub attempt_number: u32,

    /// Round-trip latency in milliseconds.
    pub latency_ms: u64,

    /// When the delivery completed.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted when an attempt fails, before the retry decision is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailedEvent {
    /// Job whose attempt failed.
    pub job_id: JobId,

    /// Destination of the job.
    pub destination_id: DestinationId,

    /// HTTP status if the receiver answered.
    pub status_code: Option<u16>,

    /// Attempt number that failed (1-based).
    pub attempt_number: u32,

    /// Error description.
    pub error_message: String,

    /// Whether the failure is retryable by policy.
    pub is_retryable: bool,

    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
}

/// Emitted when a job is re-enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryScheduledEvent {
    /// Job being retried.
    pub job_id: JobId,

    /// Destination of the job.
    pub destination_id: DestinationId,

    /// Attempts already consumed.
    pub attempts_made: u32,

    /// Minimum delay before the next attempt, in milliseconds.
    pub delay_ms: u64,

    /// Whether the delay came from the circuit breaker rather than backoff.
    pub circuit_open: bool,
}

/// Permanent failure signal for external alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    /// Destination of the failed job.
    pub destination_id: DestinationId,

    /// The failed job as of its final attempt.
    pub job: DeliveryJob,

    /// When the job was dead-lettered.
    pub failed_at: DateTime<Utc>,

    /// Final error description.
    pub final_error: String,

    /// Whether an operator has to intervene.
    pub requires_manual_intervention: bool,
}

/// Signal that a destination crossed the auto-disable threshold.
///
/// The decision to actually disable the destination is made by the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoDisableCandidateEvent {
    /// Destination that crossed the threshold.
    pub destination_id: DestinationId,

    /// Rolling failure count at the time of the signal.
    pub failure_count: u32,
}

/// Trait for handling delivery events.
///
/// Implementations should return quickly. Failures inside a handler are
/// logged by the handler itself and never propagated back into delivery
/// processing.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a delivery event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Forwards every event to all registered subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

/// Publishes events into a bounded channel.
///
/// This is the explicit output channel consumed by an external alerting
/// collaborator. Sending never waits: when the buffer is full the event is
/// dropped with a warning.
#[derive(Debug, Clone)]
pub struct ChannelEventHandler {
    sender: mpsc::Sender<DeliveryEvent>,
}

impl ChannelEventHandler {
    /// Creates a handler and the receiving half with the given capacity.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DeliveryEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Wraps an existing sender.
    pub fn from_sender(sender: mpsc::Sender<DeliveryEvent>) -> Self {
        Self { sender }
    }
}

#[async_trait::async_trait]
impl EventHandler for ChannelEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let kind = event.kind();
        let destination_id = event.destination_id().clone();

        match self.sender.try_send(event) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    event_kind = kind,
                    destination_id = %destination_id,
                    "event channel full, dropping event"
                );
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(
                    event_kind = kind,
                    destination_id = %destination_id,
                    "event channel closed, dropping event"
                );
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: DeliveryEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn auto_disable_event(count: u32) -> DeliveryEvent {
        DeliveryEvent::AutoDisableCandidate(AutoDisableCandidateEvent {
            destination_id: DestinationId::new("orders"),
            failure_count: count,
        })
    }

    #[tokio::test]
    async fn multicast_handler_forwards_to_all_subscribers() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut multicast = MulticastEventHandler::new();
        multicast.add_subscriber(Arc::new(CountingHandler { count: count.clone() }));
        multicast.add_subscriber(Arc::new(CountingHandler { count: count.clone() }));

        multicast.handle_event(auto_disable_event(3)).await;

        assert_eq!(multicast.subscriber_count(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn channel_handler_delivers_in_order() {
        let (handler, mut receiver) = ChannelEventHandler::new(4);

        handler.handle_event(auto_disable_event(1)).await;
        handler.handle_event(auto_disable_event(2)).await;

        for expected in [1, 2] {
            let Some(DeliveryEvent::AutoDisableCandidate(event)) = receiver.recv().await else {
                unreachable!("expected auto-disable event");
            };
            assert_eq!(event.failure_count, expected);
        }
    }

    #[tokio::test]
    async fn channel_handler_drops_when_full() {
        let (handler, mut receiver) = ChannelEventHandler::new(1);

        handler.handle_event(auto_disable_event(1)).await;
        handler.handle_event(auto_disable_event(2)).await;

        assert!(receiver.recv().await.is_some());
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn channel_handler_tolerates_closed_receiver() {
        let (handler, receiver) = ChannelEventHandler::new(1);
        drop(receiver);

        handler.handle_event(auto_disable_event(1)).await;
    }

    #[test]
    fn event_exposes_destination_and_kind() {
        let event = auto_disable_event(5);
        assert_eq!(event.destination_id().as_str(), "orders");
        assert_eq!(event.kind(), "auto_disable_candidate");
    }
}
