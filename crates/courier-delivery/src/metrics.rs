//! Per-destination delivery counters and latency averages.
//!
//! The aggregator is a concurrent map from destination to counters; every
//! update goes through the map's per-key lock so increments are atomic.
//! Latency percentiles are not computed here. Each executed attempt emits a
//! raw sample as a `tracing` event with target `courier::metrics`, which an
//! external metrics backend can collect.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_core::{Clock, DestinationId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::client::DeliveryOutcome;

/// Tracing target of raw latency samples.
pub const METRICS_TARGET: &str = "courier::metrics";

/// Counters for one destination, or the aggregate over all of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestinationMetrics {
    /// Executed HTTP attempts.
    pub total_deliveries: u64,
    /// Attempts answered with 2xx.
    pub successful_deliveries: u64,
    /// Attempts that failed after a request was made.
    pub failed_deliveries: u64,
    /// Running mean latency of executed attempts, in milliseconds.
    pub average_latency_ms: f64,
    /// Time of the most recent success.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Time of the most recent failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Jobs re-enqueued for another attempt.
    pub retries_scheduled: u64,
    /// Attempts rejected by the circuit breaker without a request.
    pub circuit_rejections: u64,
    /// Jobs handed to the dead-letter handler.
    pub dead_lettered: u64,
    /// Submissions suppressed as duplicates.
    pub duplicates_suppressed: u64,
}

impl DestinationMetrics {
    /// Fraction of executed attempts that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.total_deliveries == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let rate = self.successful_deliveries as f64 / self.total_deliveries as f64;
            rate
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn observe_latency(&mut self, latency_ms: f64) {
        // Called after total_deliveries was incremented.
        let n = self.total_deliveries.max(1) as f64;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / n;
    }

    #[allow(clippy::cast_precision_loss)]
    fn merge(&mut self, other: &Self) {
        let combined = self.total_deliveries + other.total_deliveries;
        if combined > 0 {
            self.average_latency_ms = (self.average_latency_ms * self.total_deliveries as f64
                + other.average_latency_ms * other.total_deliveries as f64)
                / combined as f64;
        }

        self.total_deliveries = combined;
        self.successful_deliveries += other.successful_deliveries;
        self.failed_deliveries += other.failed_deliveries;
        self.retries_scheduled += other.retries_scheduled;
        self.circuit_rejections += other.circuit_rejections;
        self.dead_lettered += other.dead_lettered;
        self.duplicates_suppressed += other.duplicates_suppressed;
        self.last_success_at = self.last_success_at.max(other.last_success_at);
        self.last_failure_at = self.last_failure_at.max(other.last_failure_at);
    }
}

/// Shared metrics registry. Cloned handles observe the same counters.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    clock: Arc<dyn Clock>,
    destinations: Arc<DashMap<DestinationId, DestinationMetrics>>,
}

impl MetricsAggregator {
    /// Creates an empty aggregator.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, destinations: Arc::new(DashMap::new()) }
    }

    /// Records an executed attempt.
    ///
    /// Circuit-open outcomes made no request and are counted as rejections
    /// instead of deliveries.
    pub fn record_attempt(&self, destination: &DestinationId, outcome: &DeliveryOutcome) {
        if outcome.was_circuit_rejected() {
            self.record_circuit_rejection(destination);
            return;
        }

        let now = self.clock.now_utc();
        #[allow(clippy::cast_precision_loss)]
        let latency_ms = outcome.latency.as_secs_f64() * 1000.0;

        {
            let mut entry = self.destinations.entry(destination.clone()).or_default();
            entry.total_deliveries += 1;
            if outcome.success {
                entry.successful_deliveries += 1;
                entry.last_success_at = Some(now);
            } else {
                entry.failed_deliveries += 1;
                entry.last_failure_at = Some(now);
            }
            entry.observe_latency(latency_ms);
        }

        tracing::info!(
            target: METRICS_TARGET,
            destination_id = %destination,
            delivery_id = %outcome.delivery_id,
            attempt = outcome.attempt_number,
            success = outcome.success,
            status_code = outcome.status_code,
            latency_ms,
            "delivery latency sample"
        );
    }

    /// Counts a circuit-open rejection.
    pub fn record_circuit_rejection(&self, destination: &DestinationId) {
        self.destinations.entry(destination.clone()).or_default().circuit_rejections += 1;
    }

    /// Counts a scheduled retry.
    pub fn record_retry_scheduled(&self, destination: &DestinationId) {
        self.destinations.entry(destination.clone()).or_default().retries_scheduled += 1;
    }

    /// Counts a dead-lettered job.
    pub fn record_dead_letter(&self, destination: &DestinationId) {
        self.destinations.entry(destination.clone()).or_default().dead_lettered += 1;
    }

    /// Counts a suppressed duplicate submission.
    pub fn record_duplicate(&self, destination: &DestinationId) {
        self.destinations.entry(destination.clone()).or_default().duplicates_suppressed += 1;
    }

    /// Metrics for one destination, if it was ever observed.
    pub fn snapshot(&self, destination: &DestinationId) -> Option<DestinationMetrics> {
        self.destinations.get(destination).map(|entry| entry.clone())
    }

    /// Sum over all destinations; the average latency is weighted by
    /// executed attempts.
    pub fn aggregate(&self) -> DestinationMetrics {
        self.destinations.iter().fold(DestinationMetrics::default(), |mut total, entry| {
            total.merge(entry.value());
            total
        })
    }

    /// Destinations with recorded metrics.
    pub fn destinations(&self) -> Vec<DestinationId> {
        self.destinations.iter().map(|entry| entry.key().clone()).collect()
    }
}
