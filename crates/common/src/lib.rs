//! Common utilities shared across the Courier crates
//!
//! This crate provides the error surface and the observability bootstrap
//! (tracing init, atomic pool metrics) used by the Courier HTTP client.
//!
//! # Module Organization
//!
//! - [`errors`]: Error types and result aliases
//! - [`observability`]: Tracing setup and pool metrics counters

pub mod errors;
pub mod observability;

// Re-export commonly used items at the crate root
pub use errors::{CourierError, CourierResult};
pub use observability::{init_tracing, PoolMetrics, PoolMetricsSnapshot};
