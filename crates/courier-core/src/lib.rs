//! Core domain models and event types.
//!
//! Provides strongly-typed identifiers, the delivery job model, lifecycle
//! events and the clock abstraction shared by the webhook delivery crates.
//! Everything here is free of delivery policy: the algorithms that act on
//! these types live in `courier-delivery`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    AutoDisableCandidateEvent, ChannelEventHandler, DeadLetterEvent, DeliveryEvent,
    DeliveryFailedEvent, DeliverySucceededEvent, EventHandler, MulticastEventHandler,
    NoOpEventHandler, RetryScheduledEvent,
};
pub use models::{
    DeadLetterRecord, DeliveryJob, Destination, DestinationId, JobId, RetryPolicy,
    RetryPolicyOverrides, SignatureAlgorithm, SignatureConfig, SignatureEncoding,
    WebhookPayload,
};
pub use time::{Clock, RealClock, TestClock};
