//! Reliable webhook delivery with retries, circuit breakers, deduplication
//! and dead-lettering.
//!
//! # Architecture
//!
//! Producers submit payloads through [`DeliveryEngine::submit_delivery`].
//! Accepted submissions become [`courier_core::DeliveryJob`]s in a
//! [`JobQueue`]; a pool of async workers claims ready jobs and runs each
//! through one attempt:
//!
//! 1. **Circuit Check** - skip the request while the destination's breaker
//!    is open
//! 2. **Signed Delivery** - POST the canonical JSON body with HMAC signature
//!    headers under a hard timeout
//! 3. **Retry Decision** - classify the failure and re-enqueue with
//!    exponential backoff plus jitter
//! 4. **Dead Letter** - persist permanently failed jobs once and raise
//!    alerting events
//!
//! Per-destination counters are available from the engine at any time.
//!
//! # Example
//!
//! ```no_run
//! use courier_core::{Destination, WebhookPayload};
//! use courier_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError, SubmitOptions};
//!
//! # async fn example() -> std::result::Result<(), DeliveryError> {
//! let mut engine = DeliveryEngine::new(DeliveryConfig::default())?;
//! engine.start().await?;
//!
//! let destination =
//!     Destination::new("orders", "https://receiver.example.com/hooks").with_secret("s3cret");
//! let payload = WebhookPayload::new("order.created", serde_json::json!({"id": 42}));
//! engine.submit_delivery(destination, payload, SubmitOptions::default()).await?;
//!
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod client;
pub mod dead_letter;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod postgres;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod signature;
pub mod worker;
pub mod worker_pool;

pub use circuit::{CircuitBreaker, CircuitBreakerRegistry, CircuitConfig, CircuitState};
pub use client::{ClientConfig, DeliveryExecutor, DeliveryOutcome};
pub use dead_letter::{DeadLetterConfig, DeadLetterHandler, DeadLetterStore, InMemoryDeadLetterStore};
pub use dedup::{DedupConfig, DedupDecision, DedupEntry, DedupOptions, DeduplicationCache};
pub use engine::{DeliveryConfig, DeliveryEngine, DeliveryEngineBuilder, SubmitOptions, Submission};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use metrics::{DestinationMetrics, MetricsAggregator};
pub use postgres::{PostgresDeadLetterStore, PostgresJobQueue};
pub use queue::{InMemoryJobQueue, JobQueue};
pub use retry::{RetryContext, RetryDecision};
pub use scheduler::{AttemptResult, RetryScheduler, UnsettledJob};
pub use worker::EngineStats;

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default batch size for claiming jobs from the queue.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default time allowed for workers to stop during shutdown, in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;
