//! Delivery engine: the producer-facing entry point.
//!
//! ```text
//! ┌──────────┐ submit  ┌─────────┐ enqueue ┌──────────┐ claim ┌─────────────┐
//! │ Producer │────────▶│  Dedup  │────────▶│ JobQueue │──────▶│ Worker Pool │
//! └──────────┘         └─────────┘         └──────────┘       └─────────────┘
//!                                               ▲                    │
//!                                    reschedule │                    ▼
//!                                         ┌──────────────┐    ┌─────────────┐
//!                                         │    Retry     │◀───│  Executor   │──▶ Destination
//!                                         │  Scheduler   │    │ (breakers)  │
//!                                         └──────────────┘    └─────────────┘
//!                                               │ give up
//!                                               ▼
//!                                         ┌──────────────┐
//!                                         │ Dead Letters │──▶ EventHandler
//!                                         └──────────────┘
//! ```
//!
//! Circuit breakers, dedup entries and metrics are registries owned by the
//! engine and shared with its workers; nothing is process-global.

use std::{sync::Arc, time::Duration};

use courier_core::{
    Clock, DeadLetterRecord, DeliveryJob, Destination, DestinationId, EventHandler, JobId,
    NoOpEventHandler, RealClock, RetryPolicy, RetryPolicyOverrides, WebhookPayload,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::{
    circuit::{CircuitBreakerRegistry, CircuitBreakerState, CircuitConfig, CircuitState},
    client::{ClientConfig, DeliveryExecutor},
    dead_letter::{DeadLetterConfig, DeadLetterHandler, DeadLetterStore, InMemoryDeadLetterStore},
    dedup::{DedupConfig, DedupDecision, DedupOptions, DeduplicationCache, FingerprintFn},
    error::{DeliveryError, Result},
    metrics::{DestinationMetrics, MetricsAggregator},
    queue::{InMemoryJobQueue, JobQueue},
    retry::MAX_RETRY_DELAY,
    scheduler::RetryScheduler,
    worker::{DeliveryWorker, EngineStats, WorkerSettings},
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum jobs to claim per worker batch.
    pub batch_size: usize,

    /// How often idle workers poll for ready jobs.
    pub poll_interval: Duration,

    /// Pause after a failed claim before polling again.
    pub error_backoff: Duration,

    /// Maximum time to wait for workers during shutdown.
    pub shutdown_timeout: Duration,

    /// Policy that submission overrides are merged over.
    pub default_retry_policy: RetryPolicy,

    /// Circuit breaker thresholds.
    pub circuit: CircuitConfig,

    /// Deduplication defaults.
    pub dedup: DedupConfig,

    /// Dead-letter triage thresholds.
    pub dead_letter: DeadLetterConfig,

    /// HTTP client configuration.
    pub client: ClientConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(crate::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
            default_retry_policy: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            dedup: DedupConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl DeliveryConfig {
    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            batch_size: self.batch_size,
            poll_interval: self.poll_interval,
            error_backoff: self.error_backoff,
        }
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Fields replacing the engine's default retry policy.
    pub retry_policy: RetryPolicyOverrides,
    /// Deduplication overrides.
    pub deduplication: DedupOptions,
    /// Higher values are claimed first among ready jobs.
    pub priority: i32,
    /// Correlation id sent as `X-Correlation-Id`; generated when absent.
    pub correlation_id: Option<Uuid>,
}

impl SubmitOptions {
    /// Sets the claim priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets retry policy overrides.
    #[must_use]
    pub fn with_retry_policy(mut self, overrides: RetryPolicyOverrides) -> Self {
        self.retry_policy = overrides;
        self
    }

    /// Sets deduplication overrides.
    #[must_use]
    pub fn with_deduplication(mut self, options: DedupOptions) -> Self {
        self.deduplication = options;
        self
    }

    /// Uses a caller-provided correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Job accepted for delivery.
    Enqueued(JobId),
    /// Equivalent payload already submitted to the destination within the
    /// deduplication window; nothing was enqueued.
    Duplicate,
}

impl Submission {
    /// Id of the enqueued job.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Enqueued(job_id) => Some(*job_id),
            Self::Duplicate => None,
        }
    }

    /// Whether the submission was suppressed.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Wires the engine's collaborators.
///
/// Anything not provided falls back to an in-memory or no-op
/// implementation on the real clock.
pub struct DeliveryEngineBuilder {
    config: DeliveryConfig,
    queue: Option<Arc<dyn JobQueue>>,
    dead_letter_store: Option<Arc<dyn DeadLetterStore>>,
    event_handler: Option<Arc<dyn EventHandler>>,
    clock: Option<Arc<dyn Clock>>,
    fingerprint: Option<FingerprintFn>,
}

impl DeliveryEngineBuilder {
    /// Uses a specific job queue.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Uses a specific dead-letter store.
    #[must_use]
    pub fn with_dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letter_store = Some(store);
        self
    }

    /// Receives delivery and dead-letter events.
    #[must_use]
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Uses an injected clock for breakers, backoff, dedup and queue timing.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the default payload fingerprint.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: FingerprintFn) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    /// Builds the engine without starting workers.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built or
    /// the configuration is invalid.
    pub fn build(self) -> Result<DeliveryEngine> {
        let config = self.config;
        validate_policy(&config.default_retry_policy)?;
        if config.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be at least 1"));
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(RealClock::new()));
        let events = self.event_handler.unwrap_or_else(|| Arc::new(NoOpEventHandler::new()));
        let queue =
            self.queue.unwrap_or_else(|| Arc::new(InMemoryJobQueue::new(clock.clone())));
        let store =
            self.dead_letter_store.unwrap_or_else(|| Arc::new(InMemoryDeadLetterStore::new()));

        let circuits = CircuitBreakerRegistry::new(config.circuit.clone(), clock.clone());
        let metrics = MetricsAggregator::new(clock.clone());
        let executor =
            DeliveryExecutor::new(config.client.clone(), circuits.clone(), metrics.clone(), clock.clone())?;
        let dead_letters =
            DeadLetterHandler::new(config.dead_letter.clone(), store, events.clone(), clock.clone());
        let scheduler = RetryScheduler::new(queue, executor, dead_letters, events, clock.clone());

        let mut dedup = DeduplicationCache::new(config.dedup.clone(), clock.clone());
        if let Some(fingerprint) = self.fingerprint {
            dedup = dedup.with_fingerprint(fingerprint);
        }

        Ok(DeliveryEngine {
            config,
            scheduler,
            dedup,
            metrics,
            circuits,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        })
    }
}

/// Main delivery engine coordinating submission and delivery workers.
pub struct DeliveryEngine {
    config: DeliveryConfig,
    scheduler: RetryScheduler,
    dedup: DeduplicationCache,
    metrics: MetricsAggregator,
    circuits: CircuitBreakerRegistry,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("config", &self.config)
            .field("started", &self.worker_pool.is_some())
            .finish_non_exhaustive()
    }
}

impl DeliveryEngine {
    /// Starts wiring an engine.
    pub fn builder(config: DeliveryConfig) -> DeliveryEngineBuilder {
        DeliveryEngineBuilder {
            config,
            queue: None,
            dead_letter_store: None,
            event_handler: None,
            clock: None,
            fingerprint: None,
        }
    }

    /// Creates an engine with in-memory storage and no event subscribers.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery client cannot be initialized.
    pub fn new(config: DeliveryConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Submits a payload for delivery to `destination`.
    ///
    /// Returns [`Submission::Duplicate`] without enqueuing when an equivalent
    /// payload was submitted to the same destination within the
    /// deduplication window.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid destination URL or
    /// retry policy, and a storage error if the queue rejects the job.
    pub async fn submit_delivery(
        &self,
        destination: Destination,
        payload: WebhookPayload,
        options: SubmitOptions,
    ) -> Result<Submission> {
        reqwest::Url::parse(&destination.url).map_err(|e| {
            DeliveryError::configuration(format!("invalid destination URL {:?}: {e}", destination.url))
        })?;
        let policy = options.retry_policy.apply(&self.config.default_retry_policy);
        validate_policy(&policy)?;

        let dedup = self.dedup.decide(&destination.id, &payload, &options.deduplication);
        if dedup.is_duplicate() {
            self.metrics.record_duplicate(&destination.id);
            self.stats.write().await.duplicates_suppressed += 1;
            info!(
                destination_id = %destination.id,
                event = %payload.event,
                "duplicate submission suppressed"
            );
            return Ok(Submission::Duplicate);
        }

        let mut job =
            DeliveryJob::new(destination, payload, policy, options.priority, self.clock.now_utc());
        if let Some(correlation_id) = options.correlation_id {
            job.correlation_id = correlation_id;
        }

        match self.scheduler.submit(job).await {
            Ok(job_id) => Ok(Submission::Enqueued(job_id)),
            Err(error) => {
                if let DedupDecision::Recorded(entry) = dedup {
                    self.dedup.forget(&entry);
                }
                Err(error)
            },
        }
    }

    /// Starts the worker pool and the periodic dedup sweep.
    ///
    /// Returns immediately after spawning. Use [`Self::shutdown`] to stop
    /// gracefully.
    ///
    /// # Errors
    ///
    /// Returns error if the engine is already running or the worker pool
    /// fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }

        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            "starting webhook delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.scheduler.clone(),
            self.config.worker_settings(),
            self.config.worker_count,
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        let dedup = self.dedup.clone();
        worker_pool.spawn_periodic("dedup-sweep", self.config.dedup.sweep_interval, move || {
            let dedup = dedup.clone();
            async move {
                let purged = dedup.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, remaining = dedup.len(), "purged expired dedup entries");
                }
            }
        });

        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Gracefully shuts down the engine.
    ///
    /// Workers finish their current attempt, return any unattempted claimed
    /// jobs to the queue and exit.
    ///
    /// # Errors
    ///
    /// Returns error if workers do not stop within the shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Claims and attempts exactly one batch on the calling task.
    ///
    /// Returns the number of jobs claimed. Intended for tests and controlled
    /// batch runs; does not start background workers.
    ///
    /// # Errors
    ///
    /// Returns error if claiming fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let worker = DeliveryWorker::new(
            0,
            self.scheduler.clone(),
            self.config.worker_settings(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        worker.process_batch().await
    }

    /// Metrics for one destination.
    pub fn metrics(&self, destination_id: &DestinationId) -> Option<DestinationMetrics> {
        self.metrics.snapshot(destination_id)
    }

    /// Metrics summed over all destinations.
    pub fn aggregate_metrics(&self) -> DestinationMetrics {
        self.metrics.aggregate()
    }

    /// Breaker mode for a destination; closed when it was never used.
    pub fn circuit_state(&self, destination_id: &DestinationId) -> CircuitState {
        self.circuits
            .get(destination_id)
            .map_or(CircuitState::Closed, |breaker| breaker.current_state())
    }

    /// Full breaker snapshots for every destination seen so far.
    pub fn circuit_states(&self) -> Vec<(DestinationId, CircuitBreakerState)> {
        self.circuits.states()
    }

    /// Closes a destination's breaker. Returns `false` for unknown
    /// destinations.
    pub fn reset_circuit(&self, destination_id: &DestinationId) -> bool {
        let reset = self.circuits.reset(destination_id);
        if reset {
            info!(destination_id = %destination_id, "circuit breaker reset manually");
        }
        reset
    }

    /// Dead-letter records for a destination, most recent first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub async fn dead_letters(
        &self,
        destination_id: &DestinationId,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>> {
        self.scheduler.dead_letters().records(destination_id, limit).await
    }

    /// Jobs waiting in the queue, ready or not.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the queue cannot be read.
    pub async fn pending_jobs(&self) -> Result<usize> {
        Ok(self.scheduler.queue().pending_count().await?)
    }

    /// Current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Deduplication cache used for submissions.
    pub fn dedup(&self) -> &DeduplicationCache {
        &self.dedup
    }

    /// Engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }
}

fn validate_policy(policy: &RetryPolicy) -> Result<()> {
    if policy.max_attempts == 0 {
        return Err(DeliveryError::configuration("max_attempts must be at least 1"));
    }
    if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
        return Err(DeliveryError::configuration(format!(
            "backoff_multiplier must be a finite value >= 1.0, got {}",
            policy.backoff_multiplier
        )));
    }
    if policy.initial_delay > policy.max_delay {
        return Err(DeliveryError::configuration("initial_delay must not exceed max_delay"));
    }
    if policy.max_delay > MAX_RETRY_DELAY {
        return Err(DeliveryError::configuration(format!(
            "max_delay must not exceed {MAX_RETRY_DELAY:?}, got {:?}",
            policy.max_delay
        )));
    }
    if policy.jitter > MAX_RETRY_DELAY {
        return Err(DeliveryError::configuration(format!(
            "jitter must not exceed {MAX_RETRY_DELAY:?}, got {:?}",
            policy.jitter
        )));
    }
    if policy.timeout.is_zero() {
        return Err(DeliveryError::configuration("timeout must be greater than zero"));
    }
    Ok(())
}
