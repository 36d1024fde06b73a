//! Worker pool management with structured concurrency.
//!
//! Provides lifecycle management and graceful shutdown for supervised
//! delivery worker tasks and the background maintenance task.

use std::{future::Future, sync::Arc, time::Duration};

use courier_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    scheduler::RetryScheduler,
    worker::{DeliveryWorker, EngineStats, WorkerSettings},
};

/// Worker pool that manages delivery worker tasks with supervision.
///
/// All tasks share one cancellation token. Call [`Self::shutdown_graceful`]
/// before dropping; dropping a running pool cancels its tasks without
/// waiting for them.
pub struct WorkerPool {
    scheduler: RetryScheduler,
    settings: WorkerSettings,
    worker_count: usize,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    background: Vec<JoinHandle<()>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new(
        scheduler: RetryScheduler,
        settings: WorkerSettings,
        worker_count: usize,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            scheduler,
            settings,
            worker_count,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            background: Vec::new(),
            clock,
        }
    }

    /// Spawn all configured workers and begin processing.
    ///
    /// Returns immediately after spawning.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the pool has no workers configured.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }

        info!(worker_count = self.worker_count, "spawning delivery workers");

        self.stats.write().await.active_workers = self.worker_count;

        for worker_id in 0..self.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.scheduler.clone(),
                self.settings,
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(
                        worker_id,
                        error = %error,
                        "delivery worker terminated with error"
                    );
                }

                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned_workers = self.worker_handles.len(), "all delivery workers spawned");

        Ok(())
    }

    /// Runs `tick` every `interval` until the pool shuts down.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, interval: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.cancellation_token.clone();
        let clock = self.clock.clone();

        self.background.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = clock.sleep(interval) => tick().await,
                    () = token.cancelled() => break,
                }
            }
            info!(task = name, "background task stopped");
        }));
    }

    /// Gracefully shutdown all tasks, waiting for in-flight attempts to
    /// complete.
    ///
    /// # Errors
    ///
    /// Returns error if the shutdown timeout is exceeded.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let worker_handles = std::mem::take(&mut self.worker_handles);
        let background = std::mem::take(&mut self.background);
        let stats = self.stats.clone();

        let shutdown_future = async move {
            let mut failures = Vec::new();

            for (worker_id, handle) in worker_handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(
                            worker_id,
                            error = %error,
                            "worker completed with error during shutdown"
                        );
                    },
                    Err(join_error) => {
                        error!(
                            worker_id,
                            error = %join_error,
                            "worker task panicked during shutdown"
                        );
                        failures.push(DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }

            for handle in background {
                if let Err(join_error) = handle.await {
                    warn!(error = %join_error, "background task failed during shutdown");
                }
            }

            stats.write().await.active_workers = 0;
            failures
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(failures) => {
                if !failures.is_empty() {
                    warn!(
                        panicked_workers = failures.len(),
                        "some workers panicked before shutdown"
                    );
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_timeout) => {
                error!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Check if any workers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count()
            + self.background.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_tasks = active_count,
                "worker pool dropped without graceful shutdown, cancelling tasks"
            );
            self.cancellation_token.cancel();
        }
    }
}
