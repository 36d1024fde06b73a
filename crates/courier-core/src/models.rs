//! Core domain models and strongly-typed identifiers.
//!
//! Defines destinations, webhook payloads, delivery jobs, retry policies and
//! dead-letter records, plus newtype ID wrappers for compile-time type
//! safety. Jobs are the unit of work that flows through the delivery queue;
//! they carry a snapshot of everything needed to attempt delivery so a worker
//! never has to consult external configuration mid-flight.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult = Result<sqlx::encode::IsNull, sqlx::error::BoxDynError>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed delivery job identifier.
///
/// Returned to producers on successful submission and used as the primary
/// key of queued jobs and dead-letter records.
///
/// # Example
///
/// ```
/// use courier_core::models::JobId;
/// let job_id = JobId::new();
/// println!("Submitted job: {}", job_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for JobId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for JobId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Identifier of a configured destination.
///
/// Destination ids come from the external configuration store, so they are
/// opaque strings rather than generated UUIDs. Circuit breakers, metrics and
/// deduplication entries are all keyed by this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(String);

impl DestinationId {
    /// Creates a destination id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DestinationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// HMAC digest used for outgoing signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    /// HMAC-SHA256.
    #[default]
    Sha256,
    /// HMAC-SHA512.
    Sha512,
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Text encoding of the signature digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureEncoding {
    /// Lowercase hexadecimal.
    #[default]
    Hex,
    /// Standard base64 with padding.
    Base64,
}

/// Signature settings for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Digest algorithm.
    #[serde(default)]
    pub algorithm: SignatureAlgorithm,
    /// Output encoding.
    #[serde(default)]
    pub encoding: SignatureEncoding,
}

/// A configured external HTTP endpoint that receives webhook deliveries.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Destination identifier.
    pub id: DestinationId,
    /// Target URL receiving the POST.
    pub url: String,
    /// Shared secret; when present every delivery is signed.
    #[serde(default)]
    pub secret: Option<String>,
    /// Static headers added to every delivery.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Signature algorithm and encoding.
    #[serde(default)]
    pub signature: SignatureConfig,
}

impl Destination {
    /// Creates an unsigned destination without static headers.
    pub fn new(id: impl Into<DestinationId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            secret: None,
            headers: HashMap::new(),
            signature: SignatureConfig::default(),
        }
    }

    /// Sets the shared signing secret.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Adds a static header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the signature algorithm and encoding.
    #[must_use]
    pub fn with_signature(mut self, signature: SignatureConfig) -> Self {
        self.signature = signature;
        self
    }
}

// Secrets must never end up in logs.
impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .field("headers", &self.headers)
            .field("signature", &self.signature)
            .finish()
    }
}

/// Event notification delivered to a destination.
///
/// Serialized as-is into the request body; receivers see exactly
/// `{"id": ..., "event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Unique payload id.
    pub id: Uuid,
    /// Event name, e.g. `invoice.paid`.
    pub event: String,
    /// Arbitrary event data.
    pub data: serde_json::Value,
}

impl WebhookPayload {
    /// Creates a payload with a fresh id.
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self { id: Uuid::new_v4(), event: event.into(), data }
    }
}

/// Retry policy snapshot attached to every job.
///
/// Durations are expressed in milliseconds when serialized so policies read
/// naturally in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound for the exponential component of the delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Growth factor applied per attempt.
    pub backoff_multiplier: f64,

    /// Upper bound of the random delay added on top of the backoff.
    #[serde(with = "duration_millis")]
    pub jitter: Duration,

    /// Hard timeout of a single HTTP call.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Status codes that are always retried.
    #[serde(default)]
    pub retry_on_status: BTreeSet<u16>,

    /// Status codes that are never retried.
    #[serde(default)]
    pub no_retry_on_status: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: Duration::from_millis(1000),
            timeout: Duration::from_secs(30),
            retry_on_status: BTreeSet::new(),
            no_retry_on_status: BTreeSet::new(),
        }
    }
}

/// Per-submission overrides merged over the engine's default policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyOverrides {
    /// Overrides [`RetryPolicy::max_attempts`].
    pub max_attempts: Option<u32>,
    /// Overrides [`RetryPolicy::initial_delay`].
    pub initial_delay: Option<Duration>,
    /// Overrides [`RetryPolicy::max_delay`].
    pub max_delay: Option<Duration>,
    /// Overrides [`RetryPolicy::backoff_multiplier`].
    pub backoff_multiplier: Option<f64>,
    /// Overrides [`RetryPolicy::jitter`].
    pub jitter: Option<Duration>,
    /// Overrides [`RetryPolicy::timeout`].
    pub timeout: Option<Duration>,
    /// Replaces [`RetryPolicy::retry_on_status`].
    pub retry_on_status: Option<BTreeSet<u16>>,
    /// Replaces [`RetryPolicy::no_retry_on_status`].
    pub no_retry_on_status: Option<BTreeSet<u16>>,
}

impl RetryPolicyOverrides {
    /// Returns `base` with every set override applied.
    pub fn apply(&self, base: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            initial_delay: self.initial_delay.unwrap_or(base.initial_delay),
            max_delay: self.max_delay.unwrap_or(base.max_delay),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(base.backoff_multiplier),
            jitter: self.jitter.unwrap_or(base.jitter),
            timeout: self.timeout.unwrap_or(base.timeout),
            retry_on_status: self
                .retry_on_status
                .clone()
                .unwrap_or_else(|| base.retry_on_status.clone()),
            no_retry_on_status: self
                .no_retry_on_status
                .clone()
                .unwrap_or_else(|| base.no_retry_on_status.clone()),
        }
    }
}

/// One attempt-lifecycle unit flowing through the delivery queue.
///
/// Created when a producer submits an event. Only the retry scheduler
/// mutates it (attempt counter and last error); it is dropped on success or
/// converted into a [`DeadLetterRecord`] on permanent failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// Job identifier.
    pub id: JobId,
    /// Destination snapshot taken at submission time.
    pub destination: Destination,
    /// Immutable event payload.
    pub payload: WebhookPayload,
    /// Retry policy snapshot.
    pub policy: RetryPolicy,
    /// Number of attempts already made.
    pub attempts_made: u32,
    /// Correlation id, stable across attempts.
    pub correlation_id: Uuid,
    /// Claim priority; higher values are claimed first.
    pub priority: i32,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Description of the most recent failure.
    pub last_error: Option<String>,
}

impl DeliveryJob {
    /// Creates a fresh job with no attempts made.
    pub fn new(
        destination: Destination,
        payload: WebhookPayload,
        policy: RetryPolicy,
        priority: i32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            destination,
            payload,
            policy,
            attempts_made: 0,
            correlation_id: Uuid::new_v4(),
            priority,
            created_at,
            last_error: None,
        }
    }

    /// Whether the retry budget is consumed.
    pub fn is_exhausted(&self) -> bool {
        self.attempts_made >= self.policy.max_attempts
    }

    /// Attempts left before the job is exhausted.
    pub fn remaining_attempts(&self) -> u32 {
        self.policy.max_attempts.saturating_sub(self.attempts_made)
    }
}

/// Permanently failed job retained for audit and alerting.
///
/// Written exactly once per job and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// The failed job as of its final attempt.
    pub job: DeliveryJob,
    /// When the job was dead-lettered.
    pub failed_at: DateTime<Utc>,
    /// Description of the final error.
    pub final_error: String,
    /// Whether an operator has to look at the destination.
    pub requires_manual_intervention: bool,
    /// Rolling failure count of the destination at hand-off time.
    pub destination_failure_count: u32,
}

impl DeadLetterRecord {
    /// Destination the job was addressed to.
    pub fn destination_id(&self) -> &DestinationId {
        &self.job.destination.id
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
