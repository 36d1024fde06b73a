//! Durable work queue abstraction for delivery jobs.
//!
//! Workers claim ready jobs in batches, attempt them and then either
//! complete them (success or dead-letter hand-off) or reschedule them with a
//! delay. The delay is a minimum wake time: a rescheduled job becomes
//! claimable at or after `now + delay`. Among ready jobs, higher priority is
//! claimed first, then earlier ready time, then submission order. No other
//! ordering is guaranteed.
//!
//! [`InMemoryJobQueue`] serves tests and single-process deployments; the
//! PostgreSQL implementation lives in [`crate::postgres`].

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use courier_core::{Clock, CoreError, DeliveryJob, JobId, Result};
use parking_lot::Mutex;

/// Boxed future returned by queue and store operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Queue operations required by the retry scheduler and workers.
pub trait JobQueue: Send + Sync + 'static {
    /// Adds a new job that becomes claimable after `delay`.
    fn enqueue(&self, job: DeliveryJob, delay: Duration) -> BoxFuture<'_, Result<JobId>>;

    /// Claims up to `batch_size` ready jobs.
    ///
    /// Claimed jobs are invisible to other claimers until completed or
    /// rescheduled.
    fn claim(&self, batch_size: usize) -> BoxFuture<'_, Result<Vec<DeliveryJob>>>;

    /// Stores the updated job and makes it claimable again after `delay`.
    fn reschedule(&self, job: DeliveryJob, delay: Duration) -> BoxFuture<'_, Result<()>>;

    /// Removes a job permanently.
    fn complete(&self, job_id: JobId) -> BoxFuture<'_, Result<()>>;

    /// Jobs waiting to be claimed, ready or not.
    fn pending_count(&self) -> BoxFuture<'_, Result<usize>>;

    /// Jobs currently claimed by workers.
    fn in_flight_count(&self) -> BoxFuture<'_, Result<usize>>;
}

#[derive(Debug, Clone)]
struct QueuedJob {
    job: DeliveryJob,
    ready_at: Instant,
    sequence: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<JobId, QueuedJob>,
    in_flight: HashMap<JobId, DeliveryJob>,
    next_sequence: u64,
}

/// In-process queue driven by an injected clock.
#[derive(Debug, Clone)]
pub struct InMemoryJobQueue {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryJobQueue {
    /// Creates an empty queue.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, state: Arc::new(Mutex::new(QueueState::default())) }
    }

    /// Time until a pending job becomes claimable; zero if already ready.
    ///
    /// Returns `None` for unknown or claimed jobs.
    pub fn ready_in(&self, job_id: JobId) -> Option<Duration> {
        let now = self.clock.now();
        self.state
            .lock()
            .pending
            .get(&job_id)
            .map(|queued| queued.ready_at.saturating_duration_since(now))
    }

    /// Snapshot of a pending job.
    pub fn get(&self, job_id: JobId) -> Option<DeliveryJob> {
        self.state.lock().pending.get(&job_id).map(|queued| queued.job.clone())
    }

    /// Time until the earliest pending job becomes claimable.
    pub fn next_ready_in(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.state
            .lock()
            .pending
            .values()
            .map(|queued| queued.ready_at.saturating_duration_since(now))
            .min()
    }

    fn push(&self, job: DeliveryJob, delay: Duration) -> Result<()> {
        let ready_at = self
            .clock
            .now()
            .checked_add(delay)
            .ok_or_else(|| CoreError::InvalidInput(format!("delay out of range: {delay:?}")))?;
        let mut state = self.state.lock();
        state.in_flight.remove(&job.id);
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.pending.insert(job.id, QueuedJob { job, ready_at, sequence });
        Ok(())
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: DeliveryJob, delay: Duration) -> BoxFuture<'_, Result<JobId>> {
        Box::pin(async move {
            let job_id = job.id;
            {
                let state = self.state.lock();
                if state.pending.contains_key(&job_id) || state.in_flight.contains_key(&job_id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "job {job_id} already queued"
                    )));
                }
            }
            self.push(job, delay)?;
            Ok(job_id)
        })
    }

    fn claim(&self, batch_size: usize) -> BoxFuture<'_, Result<Vec<DeliveryJob>>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut state = self.state.lock();

            let mut ready: Vec<_> = state
                .pending
                .values()
                .filter(|queued| queued.ready_at <= now)
                .map(|queued| (queued.job.priority, queued.ready_at, queued.sequence, queued.job.id))
                .collect();
            ready.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
            ready.truncate(batch_size);

            let mut claimed = Vec::with_capacity(ready.len());
            for (_, _, _, job_id) in ready {
                if let Some(queued) = state.pending.remove(&job_id) {
                    state.in_flight.insert(job_id, queued.job.clone());
                    claimed.push(queued.job);
                }
            }

            Ok(claimed)
        })
    }

    fn reschedule(&self, job: DeliveryJob, delay: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.push(job, delay) })
    }

    fn complete(&self, job_id: JobId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.in_flight.remove(&job_id);
            state.pending.remove(&job_id);
            Ok(())
        })
    }

    fn pending_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { Ok(self.state.lock().pending.len()) })
    }

    fn in_flight_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { Ok(self.state.lock().in_flight.len()) })
    }
}
