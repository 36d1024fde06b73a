//! Retry scheduler: drives one job through one attempt.
//!
//! ```text
//!  claim ──▶ attempt ──▶ executor ──┬─ 2xx ─────────────────▶ complete
//!                                   │
//!                                   └─ failure ─▶ decide ─┬─ retry ──▶ reschedule(delay)
//!                                                         │
//!                                                         └─ give up ─▶ dead letter ─▶ complete
//! ```
//!
//! `attempts_made` is persisted with every reschedule so a job never runs
//! more than `max_attempts` times, even across restarts. A job claimed with
//! its budget already spent is dead-lettered without another request.

use std::{sync::Arc, time::Duration};

use courier_core::{
    Clock, DeadLetterRecord, DeliveryEvent, DeliveryFailedEvent, DeliveryJob,
    DeliverySucceededEvent, EventHandler, JobId, RetryScheduledEvent,
};

use crate::{
    client::{DeliveryExecutor, DeliveryOutcome},
    dead_letter::DeadLetterHandler,
    error::{DeliveryError, Result},
    metrics::MetricsAggregator,
    queue::JobQueue,
    retry::{RetryContext, RetryDecision},
};

/// What happened to a job after one pass through the scheduler.
#[derive(Debug, Clone)]
pub enum AttemptResult {
    /// Receiver acknowledged the delivery; the job was removed.
    Delivered {
        /// Attempts made including the successful one
        attempts: u32,
        /// Status returned by the receiver
        status_code: u16,
    },
    /// Job re-enqueued for a later attempt.
    Rescheduled {
        /// Attempts made so far
        attempts: u32,
        /// Minimum wait before the next attempt
        delay: Duration,
        /// Whether the attempt was rejected by the circuit breaker
        circuit_open: bool,
    },
    /// Job handed to the dead-letter handler and removed.
    DeadLettered(Box<DeadLetterRecord>),
}

/// A job whose attempt could not be recorded in the queue or dead-letter
/// store.
///
/// The job is still claimed. The caller must return it to the queue, or it
/// stays claimed until the queue's own recovery takes over.
#[derive(Debug)]
pub struct UnsettledJob {
    /// Job with the attempt counted.
    pub job: Box<DeliveryJob>,
    /// Storage failure that prevented settlement.
    pub error: DeliveryError,
}

/// Applies retry policy to delivery outcomes and moves jobs through the
/// queue.
#[derive(Clone)]
pub struct RetryScheduler {
    queue: Arc<dyn JobQueue>,
    executor: DeliveryExecutor,
    dead_letters: DeadLetterHandler,
    events: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("executor", &self.executor)
            .field("dead_letters", &self.dead_letters)
            .finish_non_exhaustive()
    }
}

impl RetryScheduler {
    /// Creates a scheduler.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        executor: DeliveryExecutor,
        dead_letters: DeadLetterHandler,
        events: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { queue, executor, dead_letters, events, clock }
    }

    /// Queue the scheduler works against.
    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Executor used for attempts.
    pub fn executor(&self) -> &DeliveryExecutor {
        &self.executor
    }

    /// Dead-letter handler receiving permanent failures.
    pub fn dead_letters(&self) -> &DeadLetterHandler {
        &self.dead_letters
    }

    fn metrics(&self) -> &MetricsAggregator {
        self.executor.metrics()
    }

    /// Enqueues a new job for immediate delivery.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the queue rejects the job.
    pub async fn submit(&self, job: DeliveryJob) -> Result<JobId> {
        let job_id = self.queue.enqueue(job, Duration::ZERO).await?;
        tracing::debug!(job_id = %job_id, "delivery job enqueued");
        Ok(job_id)
    }

    /// Runs one attempt of a claimed job and settles it in the queue.
    ///
    /// Destination failures are folded into the result; only queue or
    /// dead-letter storage failures are returned as errors.
    ///
    /// # Errors
    ///
    /// Returns the job together with the storage error if it cannot be
    /// rescheduled, completed or dead-lettered.
    pub async fn attempt(&self, job: DeliveryJob) -> std::result::Result<AttemptResult, UnsettledJob> {
        if job.is_exhausted() {
            tracing::warn!(
                job_id = %job.id,
                destination_id = %job.destination.id,
                attempts = job.attempts_made,
                "claimed job has no attempts left"
            );
            let error = DeliveryError::retries_exhausted(job.attempts_made);
            return self
                .give_up(job.clone(), &error)
                .await
                .map_err(|error| UnsettledJob { job: Box::new(job), error });
        }

        self.deliver(job).await
    }

    async fn deliver(&self, mut job: DeliveryJob) -> std::result::Result<AttemptResult, UnsettledJob> {
        let attempt_number = job.attempts_made + 1;
        let outcome = self
            .executor
            .execute(&job.destination, &job.payload, job.correlation_id, attempt_number, &job.policy)
            .await;
        job.attempts_made = attempt_number;

        let settled = match outcome.error.clone() {
            None => self.succeed(job.clone(), &outcome).await,
            Some(error) => {
                job.last_error = outcome.error_message();
                self.publish_failure(&job, &outcome, &error).await;
                self.fail(job.clone(), &error).await
            },
        };

        settled.map_err(|error| UnsettledJob { job: Box::new(job), error })
    }

    async fn succeed(&self, job: DeliveryJob, outcome: &DeliveryOutcome) -> Result<AttemptResult> {
        self.queue.complete(job.id).await?;

        let status_code = outcome.status_code.unwrap_or_default();
        self.events
            .handle_event(DeliveryEvent::Succeeded(DeliverySucceededEvent {
                job_id: job.id,
                destination_id: job.destination.id.clone(),
                delivery_id: outcome.delivery_id,
                correlation_id: job.correlation_id,
                status_code,
                attempt_number: job.attempts_made,
                latency_ms: u64::try_from(outcome.latency.as_millis()).unwrap_or(u64::MAX),
                delivered_at: self.clock.now_utc(),
            }))
            .await;

        Ok(AttemptResult::Delivered { attempts: job.attempts_made, status_code })
    }

    async fn publish_failure(&self, job: &DeliveryJob, outcome: &DeliveryOutcome, error: &DeliveryError) {
        self.events
            .handle_event(DeliveryEvent::AttemptFailed(DeliveryFailedEvent {
                job_id: job.id,
                destination_id: job.destination.id.clone(),
                status_code: outcome.status_code,
                attempt_number: job.attempts_made,
                error_message: job.last_error.clone().unwrap_or_else(|| error.to_string()),
                is_retryable: outcome.retryable,
                failed_at: self.clock.now_utc(),
            }))
            .await;
    }

    async fn fail(&self, job: DeliveryJob, error: &DeliveryError) -> Result<AttemptResult> {
        match RetryContext::new(job.attempts_made, error, &job.policy).decide() {
            RetryDecision::Retry { delay, circuit_open } => {
                let job_id = job.id;
                let destination_id = job.destination.id.clone();
                let attempts = job.attempts_made;

                self.queue.reschedule(job, delay).await?;
                self.metrics().record_retry_scheduled(&destination_id);

                tracing::info!(
                    job_id = %job_id,
                    destination_id = %destination_id,
                    attempt = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    circuit_open,
                    "delivery retry scheduled"
                );

                self.events
                    .handle_event(DeliveryEvent::RetryScheduled(RetryScheduledEvent {
                        job_id,
                        destination_id,
                        attempts_made: attempts,
                        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        circuit_open,
                    }))
                    .await;

                Ok(AttemptResult::Rescheduled { attempts, delay, circuit_open })
            },
            RetryDecision::GiveUp { reason } => {
                tracing::debug!(job_id = %job.id, reason = %reason, "giving up on delivery job");
                self.give_up(job, error).await
            },
        }
    }

    async fn give_up(&self, job: DeliveryJob, error: &DeliveryError) -> Result<AttemptResult> {
        let job_id = job.id;
        let destination_id = job.destination.id.clone();

        // Persist the dead letter before removing the job: a crash in between
        // re-claims an exhausted job, and the store ignores the second hand-off.
        let record = self.dead_letters.handle(job, error).await?;
        self.queue.complete(job_id).await?;
        self.metrics().record_dead_letter(&destination_id);

        Ok(AttemptResult::DeadLettered(Box::new(record)))
    }
}
