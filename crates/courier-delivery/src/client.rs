//! Delivery executor: one signed HTTP POST per attempt under a hard timeout.
//!
//! The executor consults the destination's circuit breaker before sending,
//! updates it exactly once after every executed request and reports the
//! outcome to the metrics aggregator. Any HTTP status is a definite outcome;
//! classification into retryable or permanent happens against the job's
//! retry policy.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use courier_core::{Clock, Destination, RetryPolicy, WebhookPayload};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::{
    circuit::CircuitBreakerRegistry,
    error::{DeliveryError, ErrorCategory, Result},
    metrics::MetricsAggregator,
    retry, signature,
};

/// Header carrying the event name.
pub const HEADER_EVENT: &str = "x-event";
/// Header carrying the per-attempt delivery id.
pub const HEADER_DELIVERY_ID: &str = "x-delivery-id";
/// Header carrying the signing timestamp in Unix milliseconds.
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
/// Header carrying the job's correlation id.
pub const HEADER_CORRELATION_ID: &str = "x-correlation-id";
/// Header carrying the HMAC signature.
pub const HEADER_SIGNATURE: &str = "x-signature";

/// Configuration for the HTTP client shared by all workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// Response body bytes kept for logs and error messages.
    pub max_logged_body_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Courier-Webhook-Delivery/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 3,
            verify_tls: true,
            max_logged_body_bytes: 1024,
        }
    }
}

/// Result of one delivery attempt. Never persisted.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    /// Whether the receiver answered with 2xx.
    pub success: bool,
    /// HTTP status, if a response was received.
    pub status_code: Option<u16>,
    /// Time from send to fully read response.
    pub latency: Duration,
    /// Attempt number (1-based).
    pub attempt_number: u32,
    /// Whether the failure is retryable under the job's policy.
    pub retryable: bool,
    /// Failure, absent on success.
    pub error: Option<DeliveryError>,
    /// Id sent in `X-Delivery-Id`; nil when no request was made.
    pub delivery_id: Uuid,
    /// Truncated response body.
    pub response_body: Option<String>,
}

impl DeliveryOutcome {
    /// Outcome of an attempt rejected by the circuit breaker.
    pub fn circuit_rejected(attempt_number: u32, error: DeliveryError) -> Self {
        Self {
            success: false,
            status_code: None,
            latency: Duration::ZERO,
            attempt_number,
            retryable: true,
            error: Some(error),
            delivery_id: Uuid::nil(),
            response_body: None,
        }
    }

    fn rejected(attempt_number: u32, error: DeliveryError) -> Self {
        Self { retryable: false, ..Self::circuit_rejected(attempt_number, error) }
    }

    /// Whether the breaker rejected the attempt without a request.
    pub fn was_circuit_rejected(&self) -> bool {
        matches!(self.error, Some(DeliveryError::CircuitOpen { .. }))
    }

    /// Error category, absent on success.
    pub fn category(&self) -> Option<ErrorCategory> {
        self.error.as_ref().map(ErrorCategory::from)
    }

    /// Human-readable error, absent on success.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|error| match &self.response_body {
            Some(body) if !body.is_empty() => format!("{error}: {body}"),
            _ => error.to_string(),
        })
    }
}

/// Executes signed webhook deliveries.
///
/// Cheap to clone; the reqwest connection pool, breaker registry and
/// metrics are shared.
#[derive(Debug, Clone)]
pub struct DeliveryExecutor {
    client: reqwest::Client,
    config: ClientConfig,
    circuits: CircuitBreakerRegistry,
    metrics: MetricsAggregator,
    clock: Arc<dyn Clock>,
}

impl DeliveryExecutor {
    /// Creates an executor.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built with the provided settings.
    pub fn new(
        config: ClientConfig,
        circuits: CircuitBreakerRegistry,
        metrics: MetricsAggregator,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config, circuits, metrics, clock })
    }

    /// Breaker registry consulted by this executor.
    pub fn circuits(&self) -> &CircuitBreakerRegistry {
        &self.circuits
    }

    /// Metrics aggregator fed by this executor.
    pub fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    /// Performs one delivery attempt.
    ///
    /// Never returns an error: every failure is captured in the outcome.
    pub async fn execute(
        &self,
        destination: &Destination,
        payload: &WebhookPayload,
        correlation_id: Uuid,
        attempt_number: u32,
        policy: &RetryPolicy,
    ) -> DeliveryOutcome {
        let delivery_id = Uuid::new_v4();
        let span = info_span!(
            "webhook_delivery",
            destination_id = %destination.id,
            delivery_id = %delivery_id,
            correlation_id = %correlation_id,
            attempt = attempt_number,
        );

        async move {
            let timestamp_ms = self.clock.unix_millis();
            let request = match self.prepare(destination, payload, delivery_id, correlation_id, timestamp_ms) {
                Ok(request) => request,
                Err(error) => {
                    tracing::error!(error = %error, "failed to prepare delivery request");
                    return DeliveryOutcome::rejected(attempt_number, error);
                },
            };

            let breaker = self.circuits.breaker(&destination.id);
            if let Err(error) = breaker.check() {
                tracing::debug!(error = %error, "circuit open, skipping request");
                let outcome = DeliveryOutcome::circuit_rejected(attempt_number, error);
                self.metrics.record_attempt(&destination.id, &outcome);
                return outcome;
            }

            let outcome = self.send(request, delivery_id, attempt_number, policy).await;

            if outcome.success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
            self.metrics.record_attempt(&destination.id, &outcome);

            outcome
        }
        .instrument(span)
        .await
    }

    fn prepare(
        &self,
        destination: &Destination,
        payload: &WebhookPayload,
        delivery_id: Uuid,
        correlation_id: Uuid,
        timestamp_ms: u64,
    ) -> Result<(reqwest::Url, HeaderMap, Bytes)> {
        let url = reqwest::Url::parse(&destination.url).map_err(|e| {
            DeliveryError::configuration(format!("invalid destination URL {:?}: {e}", destination.url))
        })?;
        let body = signature::canonical_payload(payload)
            .map_err(|e| DeliveryError::internal(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &destination.headers {
            if is_managed_header(name) {
                tracing::debug!(header = %name, "ignoring static header that shadows a managed header");
                continue;
            }
            match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                },
                _ => tracing::warn!(header = %name, "ignoring invalid static header"),
            }
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(HEADER_EVENT, header_value(&payload.event)?);
        headers.insert(HEADER_DELIVERY_ID, header_value(&delivery_id.to_string())?);
        headers.insert(HEADER_TIMESTAMP, header_value(&timestamp_ms.to_string())?);
        headers.insert(HEADER_CORRELATION_ID, header_value(&correlation_id.to_string())?);

        if let Some(secret) = &destination.secret {
            let signature = signature::sign(secret, timestamp_ms, &body, destination.signature)
                .map_err(|e| DeliveryError::configuration(format!("cannot sign payload: {e}")))?;
            headers.insert(HEADER_SIGNATURE, header_value(&signature)?);
        }

        Ok((url, headers, Bytes::from(body)))
    }

    async fn send(
        &self,
        (url, headers, body): (reqwest::Url, HeaderMap, Bytes),
        delivery_id: Uuid,
        attempt_number: u32,
        policy: &RetryPolicy,
    ) -> DeliveryOutcome {
        let start = self.clock.now();
        let request = self.client.post(url).headers(headers).body(body).timeout(policy.timeout);

        // Dropping the future on expiry aborts the in-flight request.
        let result = tokio::time::timeout(policy.timeout, async {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, bytes))
        })
        .await;

        let latency = self.clock.now().saturating_duration_since(start);
        let duration_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);

        let (status_code, response_body, error) = match result {
            Ok(Ok((status, bytes))) => {
                let body = self.truncate_body(&bytes);
                if (200..300).contains(&status) {
                    tracing::info!(status_code = status, duration_ms, "webhook delivered");
                    (Some(status), Some(body), None)
                } else {
                    tracing::warn!(status_code = status, duration_ms, "receiver returned error status");
                    (Some(status), Some(body.clone()), Some(DeliveryError::from_status(status, body)))
                }
            },
            Ok(Err(e)) if e.is_timeout() => {
                tracing::warn!(duration_ms, "request timed out");
                (None, None, Some(DeliveryError::timeout(policy.timeout)))
            },
            Ok(Err(e)) => {
                tracing::warn!(duration_ms, error = %e, "request failed");
                (None, None, Some(DeliveryError::network(e.to_string())))
            },
            Err(_) => {
                tracing::warn!(duration_ms, "request abandoned after hard timeout");
                (None, None, Some(DeliveryError::timeout(policy.timeout)))
            },
        };

        let retryable = error.as_ref().is_some_and(|error| retry::is_retryable(error, policy));

        DeliveryOutcome {
            success: error.is_none(),
            status_code,
            latency,
            attempt_number,
            retryable,
            error,
            delivery_id,
            response_body,
        }
    }

    fn truncate_body(&self, bytes: &[u8]) -> String {
        let limit = self.config.max_logged_body_bytes;
        if bytes.len() > limit {
            let truncated = String::from_utf8_lossy(&bytes[..limit]);
            format!("{truncated}... (truncated)")
        } else {
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::try_from(value)
        .map_err(|e| DeliveryError::configuration(format!("invalid header value {value:?}: {e}")))
}

/// Headers that static destination headers may never set.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_ascii_lowercase();
    matches!(
        lowercase.as_str(),
        "content-type"
            | "content-length"
            | "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | HEADER_EVENT
            | HEADER_DELIVERY_ID
            | HEADER_TIMESTAMP
            | HEADER_CORRELATION_ID
            | HEADER_SIGNATURE
    )
}
