//! Delivery worker loop.
//!
//! Each worker claims a batch of ready jobs, runs them through the retry
//! scheduler one at a time and polls again. Destination failures never leave
//! the loop. A job that cannot be settled is returned to the queue after the
//! error backoff, and a failed claim makes the worker back off before
//! claiming again.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, DeliveryJob};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    error::Result,
    scheduler::{AttemptResult, RetryScheduler},
};

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of active delivery workers.
    pub active_workers: usize,
    /// Attempts processed since startup, including circuit rejections.
    pub jobs_processed: u64,
    /// Jobs delivered successfully.
    pub successful_deliveries: u64,
    /// Jobs re-enqueued after a failed attempt.
    pub retries_scheduled: u64,
    /// Jobs handed to the dead-letter handler.
    pub dead_lettered: u64,
    /// Submissions suppressed as duplicates.
    pub duplicates_suppressed: u64,
    /// Jobs currently being attempted.
    pub in_flight_deliveries: u64,
}

/// Loop settings shared by all workers.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Maximum jobs claimed per batch.
    pub batch_size: usize,
    /// Wait between polls when the queue had nothing ready.
    pub poll_interval: Duration,
    /// Wait after a failed claim before trying again.
    pub error_backoff: Duration,
}

/// Individual worker that processes delivery jobs.
pub struct DeliveryWorker {
    id: usize,
    scheduler: RetryScheduler,
    settings: WorkerSettings,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a new delivery worker.
    pub fn new(
        id: usize,
        scheduler: RetryScheduler,
        settings: WorkerSettings,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, scheduler, settings, stats, cancellation_token, clock }
    }

    /// Claims and processes batches until cancelled.
    ///
    /// # Errors
    ///
    /// Currently never returns an error; claim failures are logged and
    /// retried after the configured backoff.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.settings.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        error = %error,
                        "worker batch processing failed"
                    );
                    tokio::select! {
                        () = self.clock.sleep(self.settings.error_backoff) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims one batch and attempts every job in it.
    ///
    /// Returns the number of jobs claimed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the claim fails. Failures of individual
    /// jobs are logged, not returned.
    pub async fn process_batch(&self) -> Result<usize> {
        let jobs = self.scheduler.queue().claim(self.settings.batch_size).await?;
        let batch_size = jobs.len();

        if batch_size > 0 {
            debug!(worker_id = self.id, batch_size, "processing job batch");
        }

        let mut jobs = jobs.into_iter();
        while let Some(job) = jobs.next() {
            if self.cancellation_token.is_cancelled() {
                self.release(std::iter::once(job).chain(jobs)).await;
                break;
            }

            self.process_job(job).await;
        }

        Ok(batch_size)
    }

    async fn process_job(&self, job: DeliveryJob) {
        let job_id = job.id;
        let destination_id = job.destination.id.clone();

        self.stats.write().await.in_flight_deliveries += 1;
        let result = self.scheduler.attempt(job).await;

        let mut stats = self.stats.write().await;
        stats.in_flight_deliveries = stats.in_flight_deliveries.saturating_sub(1);
        stats.jobs_processed += 1;

        match result {
            Ok(AttemptResult::Delivered { .. }) => stats.successful_deliveries += 1,
            Ok(AttemptResult::Rescheduled { .. }) => stats.retries_scheduled += 1,
            Ok(AttemptResult::DeadLettered(_)) => stats.dead_lettered += 1,
            Err(unsettled) => {
                drop(stats);
                error!(
                    worker_id = self.id,
                    job_id = %job_id,
                    destination_id = %destination_id,
                    attempts = unsettled.job.attempts_made,
                    error = %unsettled.error,
                    "failed to settle delivery job, returning it to the queue"
                );
                self.requeue(*unsettled.job, self.settings.error_backoff).await;
            },
        }
    }

    /// Puts a claimed job back so another claim settles it.
    async fn requeue(&self, job: DeliveryJob, delay: Duration) {
        let job_id = job.id;
        if let Err(error) = self.scheduler.queue().reschedule(job, delay).await {
            error!(
                worker_id = self.id,
                job_id = %job_id,
                error = %error,
                "failed to return unsettled job to the queue"
            );
        }
    }

    /// Returns claimed but unattempted jobs to the queue unchanged.
    async fn release(&self, jobs: impl Iterator<Item = DeliveryJob>) {
        for job in jobs {
            self.requeue(job, Duration::ZERO).await;
        }
    }
}
