//! Error types for webhook delivery operations.
//!
//! Every failure a delivery attempt can observe is modelled here and mapped
//! onto the [`ErrorCategory`] taxonomy used for retry decisions, metrics and
//! dead-letter triage. Destination failures never escape a worker; they are
//! classified and routed to the retry scheduler instead.

use std::{fmt, time::Duration};

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for webhook delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// No response was received: connection, DNS or TLS failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// The hard per-attempt timeout elapsed before a response arrived.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// Receiver answered with a non-2xx status below 500.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Receiver answered with a 5xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Circuit breaker rejected the attempt; no request was made.
    #[error("circuit breaker open for destination {destination_id}")]
    CircuitOpen {
        /// Destination whose circuit is open
        destination_id: String,
        /// Time until the breaker expects to admit probes again
        retry_after: Duration,
    },

    /// Retry budget consumed.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// Queue or dead-letter storage failed.
    #[error("storage error: {message}")]
    StorageError {
        /// Storage error message
        message: String,
    },

    /// Invalid destination or engine configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Engine is shutting down.
    #[error("delivery engine shutdown requested")]
    ShutdownRequested,

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the worker
        worker_id: usize,
        /// Panic description from the join error
        error: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates the matching error for a non-2xx HTTP status.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        if status_code >= 500 {
            Self::ServerError { status_code, body: body.into() }
        } else {
            Self::ClientError { status_code, body: body.into() }
        }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(destination_id: impl Into<String>, retry_after: Duration) -> Self {
        Self::CircuitOpen { destination_id: destination_id.into(), retry_after }
    }

    /// Creates a retries exhausted error.
    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::RetriesExhausted { attempts }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// HTTP status carried by the error, if the receiver answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            _ => None,
        }
    }

    /// Whether the failure happened without any HTTP response.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::NetworkError { .. } | Self::Timeout { .. })
    }

    /// Default retry classification, ignoring per-job status overrides.
    ///
    /// Returns `true` for transport failures, 5xx, 408, 429 and open
    /// circuits. Per-job policies refine HTTP statuses via
    /// [`crate::retry::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        match ErrorCategory::from(self) {
            ErrorCategory::TransientNetwork
            | ErrorCategory::TransientServer
            | ErrorCategory::CircuitOpen
            | ErrorCategory::Storage => true,

            ErrorCategory::PermanentClient
            | ErrorCategory::Exhausted
            | ErrorCategory::Configuration
            | ErrorCategory::Internal => false,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::InvalidInput(message) => Self::configuration(message),
            other => Self::storage(other.to_string()),
        }
    }
}

/// Failure taxonomy used for retry decisions, metrics and dead-letter triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// No response received.
    TransientNetwork,
    /// 5xx, 408 or 429.
    TransientServer,
    /// Any other non-2xx status, or an explicitly non-retryable one.
    PermanentClient,
    /// Destination suspended by its circuit breaker.
    CircuitOpen,
    /// Retry budget consumed.
    Exhausted,
    /// Queue or dead-letter storage.
    Storage,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl ErrorCategory {
    /// Default category for an HTTP status.
    pub fn for_status(status_code: u16) -> Self {
        if status_code >= 500 || status_code == 408 || status_code == 429 {
            Self::TransientServer
        } else {
            Self::PermanentClient
        }
    }
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => {
                Self::TransientNetwork
            },
            DeliveryError::ClientError { status_code, .. }
            | DeliveryError::ServerError { status_code, .. } => Self::for_status(*status_code),
            DeliveryError::CircuitOpen { .. } => Self::CircuitOpen,
            DeliveryError::RetriesExhausted { .. } => Self::Exhausted,
            DeliveryError::StorageError { .. } => Self::Storage,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShutdownRequested
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientNetwork => write!(f, "transient-network"),
            Self::TransientServer => write!(f, "transient-server"),
            Self::PermanentClient => write!(f, "permanent-client"),
            Self::CircuitOpen => write!(f, "circuit-open"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Storage => write!(f, "storage"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_classification() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(Duration::from_secs(30)).is_retryable());
        assert!(DeliveryError::from_status(503, "unavailable").is_retryable());
        assert!(DeliveryError::from_status(408, "").is_retryable());
        assert!(DeliveryError::from_status(429, "").is_retryable());
        assert!(DeliveryError::circuit_open("d", Duration::from_secs(1)).is_retryable());

        assert!(!DeliveryError::from_status(404, "not found").is_retryable());
        assert!(!DeliveryError::from_status(400, "bad request").is_retryable());
        assert!(!DeliveryError::retries_exhausted(5).is_retryable());
        assert!(!DeliveryError::configuration("invalid URL").is_retryable());
    }

    #[test]
    fn status_split_between_client_and_server_variants() {
        assert!(matches!(
            DeliveryError::from_status(502, ""),
            DeliveryError::ServerError { status_code: 502, .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(301, ""),
            DeliveryError::ClientError { status_code: 301, .. }
        ));
        assert_eq!(DeliveryError::from_status(418, "").status_code(), Some(418));
        assert_eq!(DeliveryError::network("x").status_code(), None);
    }

    #[test]
    fn categories_render_as_taxonomy_names() {
        assert_eq!(
            ErrorCategory::from(&DeliveryError::network("reset")).to_string(),
            "transient-network"
        );
        assert_eq!(ErrorCategory::from(&DeliveryError::from_status(429, "")), ErrorCategory::TransientServer);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::from_status(404, "")).to_string(),
            "permanent-client"
        );
        assert_eq!(
            ErrorCategory::from(&DeliveryError::circuit_open("d", Duration::ZERO)).to_string(),
            "circuit-open"
        );
    }

    #[test]
    fn core_errors_map_to_storage_or_configuration() {
        let storage = DeliveryError::from(CoreError::Database("down".into()));
        assert_eq!(ErrorCategory::from(&storage), ErrorCategory::Storage);

        let invalid = DeliveryError::from(CoreError::InvalidInput("bad url".into()));
        assert_eq!(ErrorCategory::from(&invalid), ErrorCategory::Configuration);
    }

    #[test]
    fn error_display_format() {
        let error = DeliveryError::timeout(Duration::from_millis(1500));
        assert_eq!(error.to_string(), "request timeout after 1500ms");

        let circuit_error = DeliveryError::circuit_open("billing", Duration::from_secs(5));
        assert_eq!(circuit_error.to_string(), "circuit breaker open for destination billing");
    }
}
