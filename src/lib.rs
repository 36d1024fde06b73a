//! Courier webhook delivery service.
//!
//! Wires the delivery engine from [`courier_delivery`] to a configuration
//! layer and an alerting sink. The `courier` binary is a thin shell over
//! this crate.

pub mod alerts;
pub mod config;

pub use alerts::LoggingAlertHandler;
pub use config::Config;
