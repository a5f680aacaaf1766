//! Prometheus metrics for the Volume Data Source Validator
//!
//! Counts validations by result and serves them over HTTP when an endpoint
//! is configured.

mod prometheus;

pub use prometheus::*;
