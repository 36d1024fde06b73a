//! Permanent-failure triage.
//!
//! Jobs that exhaust their retry budget or fail with a non-retryable error
//! are persisted exactly once as [`DeadLetterRecord`]s. The handler keeps a
//! rolling per-destination failure count and raises two signals through the
//! [`EventHandler`]:
//!
//! - `DeadLettered` for every hand-off, for external alerting
//! - `AutoDisableCandidate` whenever the rolling count is at or above the
//!   configured threshold
//!
//! Disabling a destination is left to the consumer. The auto-disable count
//! is independent of the circuit breaker: a destination can be circuit-open
//! and accumulating dead letters at the same time.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use courier_core::{
    AutoDisableCandidateEvent, Clock, DeadLetterEvent, DeadLetterRecord, DeliveryEvent,
    DeliveryJob, DestinationId, EventHandler, JobId,
};
use dashmap::{mapref::entry::Entry, DashMap};

use crate::{
    error::{DeliveryError, ErrorCategory, Result},
    queue::BoxFuture,
    retry,
};

/// Thresholds for dead-letter triage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterConfig {
    /// Rolling failures that make a destination an auto-disable candidate.
    /// Zero disables the signal.
    pub auto_disable_threshold: u32,
    /// Span of the rolling failure count.
    pub failure_window: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self { auto_disable_threshold: 10, failure_window: Duration::from_secs(3600) }
    }
}

/// Persistence for dead-letter records.
pub trait DeadLetterStore: Send + Sync + 'static {
    /// Stores a record. Returns `false` when a record for the same job
    /// already exists, in which case nothing is written.
    fn store(&self, record: DeadLetterRecord) -> BoxFuture<'_, courier_core::Result<bool>>;

    /// Record for a job, if it was dead-lettered.
    fn get(&self, job_id: JobId) -> BoxFuture<'_, courier_core::Result<Option<DeadLetterRecord>>>;

    /// Records for a destination, most recent first.
    fn records_for(
        &self,
        destination_id: DestinationId,
        limit: usize,
    ) -> BoxFuture<'_, courier_core::Result<Vec<DeadLetterRecord>>>;

    /// Total number of stored records.
    fn count(&self) -> BoxFuture<'_, courier_core::Result<usize>>;
}

/// In-memory dead-letter store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterStore {
    records: Arc<DashMap<JobId, DeadLetterRecord>>,
}

impl InMemoryDeadLetterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn store(&self, record: DeadLetterRecord) -> BoxFuture<'_, courier_core::Result<bool>> {
        Box::pin(async move {
            match self.records.entry(record.job.id) {
                Entry::Occupied(_) => Ok(false),
                Entry::Vacant(entry) => {
                    entry.insert(record);
                    Ok(true)
                },
            }
        })
    }

    fn get(&self, job_id: JobId) -> BoxFuture<'_, courier_core::Result<Option<DeadLetterRecord>>> {
        Box::pin(async move { Ok(self.records.get(&job_id).map(|entry| entry.clone())) })
    }

    fn records_for(
        &self,
        destination_id: DestinationId,
        limit: usize,
    ) -> BoxFuture<'_, courier_core::Result<Vec<DeadLetterRecord>>> {
        Box::pin(async move {
            let mut records: Vec<_> = self
                .records
                .iter()
                .filter(|entry| entry.destination_id() == &destination_id)
                .map(|entry| entry.clone())
                .collect();
            records.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
            records.truncate(limit);
            Ok(records)
        })
    }

    fn count(&self) -> BoxFuture<'_, courier_core::Result<usize>> {
        Box::pin(async move { Ok(self.records.len()) })
    }
}

/// Receives permanently failed jobs.
#[derive(Clone)]
pub struct DeadLetterHandler {
    config: DeadLetterConfig,
    store: Arc<dyn DeadLetterStore>,
    events: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    failures: Arc<DashMap<DestinationId, VecDeque<Instant>>>,
}

impl std::fmt::Debug for DeadLetterHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterHandler")
            .field("config", &self.config)
            .field("tracked_destinations", &self.failures.len())
            .finish_non_exhaustive()
    }
}

impl DeadLetterHandler {
    /// Creates a handler.
    pub fn new(
        config: DeadLetterConfig,
        store: Arc<dyn DeadLetterStore>,
        events: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, store, events, clock, failures: Arc::new(DashMap::new()) }
    }

    /// Persists a failed job and raises the failure signals.
    ///
    /// Handing off the same job twice returns the stored record and raises
    /// no further signals.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the record cannot be persisted.
    pub async fn handle(&self, mut job: DeliveryJob, error: &DeliveryError) -> Result<DeadLetterRecord> {
        let final_error = match (error, &job.last_error) {
            (DeliveryError::RetriesExhausted { .. }, Some(last_error)) => {
                format!("{error}: {last_error}")
            },
            _ => error.to_string(),
        };
        let category = retry::classify(error, &job.policy);
        let destination_id = job.destination.id.clone();
        job.last_error = Some(final_error.clone());

        let failure_count = self.increment(&destination_id);
        let auto_disable =
            self.config.auto_disable_threshold > 0 && failure_count >= self.config.auto_disable_threshold;

        let record = DeadLetterRecord {
            job,
            failed_at: self.clock.now_utc(),
            final_error,
            requires_manual_intervention: matches!(
                category,
                ErrorCategory::PermanentClient | ErrorCategory::Configuration
            ) || auto_disable,
            destination_failure_count: failure_count,
        };

        let inserted = match self.store.store(record.clone()).await {
            Ok(inserted) => inserted,
            Err(e) => {
                self.decrement(&destination_id);
                return Err(e.into());
            },
        };

        if !inserted {
            self.decrement(&destination_id);
            tracing::debug!(
                job_id = %record.job.id,
                destination_id = %destination_id,
                "job already dead-lettered, ignoring repeated hand-off"
            );
            let existing = self.store.get(record.job.id).await?;
            return existing.ok_or_else(|| {
                DeliveryError::storage(format!("dead letter for job {} vanished", record.job.id))
            });
        }

        tracing::error!(
            job_id = %record.job.id,
            destination_id = %destination_id,
            attempts = record.job.attempts_made,
            error_category = %category,
            failure_count,
            requires_manual_intervention = record.requires_manual_intervention,
            error = %record.final_error,
            "job dead-lettered"
        );

        self.events
            .handle_event(DeliveryEvent::DeadLettered(DeadLetterEvent {
                destination_id: destination_id.clone(),
                job: record.job.clone(),
                failed_at: record.failed_at,
                final_error: record.final_error.clone(),
                requires_manual_intervention: record.requires_manual_intervention,
            }))
            .await;

        if auto_disable {
            tracing::warn!(
                destination_id = %destination_id,
                failure_count,
                threshold = self.config.auto_disable_threshold,
                "destination is an auto-disable candidate"
            );
            self.events
                .handle_event(DeliveryEvent::AutoDisableCandidate(AutoDisableCandidateEvent {
                    destination_id,
                    failure_count,
                }))
                .await;
        }

        Ok(record)
    }

    /// Rolling failure count for a destination.
    pub fn failure_count(&self, destination_id: &DestinationId) -> u32 {
        let now = self.clock.now();
        self.failures.get_mut(destination_id).map_or(0, |mut window| {
            self.prune(&mut window, now);
            u32::try_from(window.len()).unwrap_or(u32::MAX)
        })
    }

    /// Dead-letter records for a destination, most recent first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read.
    pub async fn records(&self, destination_id: &DestinationId, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        Ok(self.store.records_for(destination_id.clone(), limit).await?)
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn DeadLetterStore> {
        &self.store
    }

    fn increment(&self, destination_id: &DestinationId) -> u32 {
        let now = self.clock.now();
        let mut window = self.failures.entry(destination_id.clone()).or_default();
        self.prune(&mut window, now);
        window.push_back(now);
        u32::try_from(window.len()).unwrap_or(u32::MAX)
    }

    fn decrement(&self, destination_id: &DestinationId) {
        if let Some(mut window) = self.failures.get_mut(destination_id) {
            window.pop_back();
        }
    }

    fn prune(&self, window: &mut VecDeque<Instant>, now: Instant) {
        while window
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= self.config.failure_window)
        {
            window.pop_front();
        }
    }
}
