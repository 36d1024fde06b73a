//! Alert sink for permanent delivery failures.
//!
//! The engine publishes lifecycle events without knowing who listens. The
//! service binary subscribes this handler to turn dead letters and
//! auto-disable candidates into operator-facing log lines.

use std::sync::atomic::{AtomicU64, Ordering};

use courier_core::{DeliveryEvent, EventHandler};
use tracing::{debug, error, warn};

/// Logs delivery events at a severity matching their urgency.
#[derive(Debug, Default)]
pub struct LoggingAlertHandler {
    alerts: AtomicU64,
}

impl LoggingAlertHandler {
    /// Creates a handler with no alerts raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of alerts raised so far.
    pub fn alerts_raised(&self) -> u64 {
        self.alerts.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl EventHandler for LoggingAlertHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        match event {
            DeliveryEvent::DeadLettered(event) => {
                self.alerts.fetch_add(1, Ordering::Relaxed);
                if event.requires_manual_intervention {
                    error!(
                        job_id = %event.job.id,
                        destination_id = %event.destination_id,
                        attempts = event.job.attempts_made,
                        final_error = %event.final_error,
                        "webhook dead-lettered, manual intervention required"
                    );
                } else {
                    warn!(
                        job_id = %event.job.id,
                        destination_id = %event.destination_id,
                        attempts = event.job.attempts_made,
                        final_error = %event.final_error,
                        "webhook dead-lettered"
                    );
                }
            },
            DeliveryEvent::AutoDisableCandidate(event) => {
                self.alerts.fetch_add(1, Ordering::Relaxed);
                error!(
                    destination_id = %event.destination_id,
                    failure_count = event.failure_count,
                    "destination exceeded permanent failure threshold, consider disabling it"
                );
            },
            other => {
                debug!(event_kind = other.kind(), destination_id = %other.destination_id(), "delivery event");
            },
        }
    }
}
