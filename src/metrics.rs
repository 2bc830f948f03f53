//! Metric helpers for the server core.
//!
//! Thin wrappers over the [`metrics`](https://docs.rs/metrics) crate. Every
//! function becomes a no-op when the optional `metrics` Cargo feature is
//! disabled, so call sites stay unconditional.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking open connections.
pub const CONNECTIONS_ACTIVE: &str = "callframe_connections_active";
/// Name of the counter tracking dispatched calls.
pub const CALLS_TOTAL: &str = "callframe_calls_total";
/// Name of the counter tracking calls that returned an error.
pub const CALL_ERRORS_TOTAL: &str = "callframe_call_errors_total";
/// Name of the counter tracking recovered call panics.
pub const CALL_PANICS_TOTAL: &str = "callframe_call_panics_total";

/// Increment the open-connections gauge.
#[cfg(feature = "metrics")]
pub fn inc_connections() {
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

#[cfg(not(feature = "metrics"))]
pub fn inc_connections() {}

/// Decrement the open-connections gauge.
#[cfg(feature = "metrics")]
pub fn dec_connections() {
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

#[cfg(not(feature = "metrics"))]
pub fn dec_connections() {}

/// Record a dispatched call.
#[cfg(feature = "metrics")]
pub fn inc_calls() {
    counter!(CALLS_TOTAL).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub fn inc_calls() {}

/// Record a call that completed with an error response.
#[cfg(feature = "metrics")]
pub fn inc_call_errors() {
    counter!(CALL_ERRORS_TOTAL).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub fn inc_call_errors() {}

/// Record a recovered call panic.
#[cfg(feature = "metrics")]
pub fn inc_call_panics() {
    counter!(CALL_PANICS_TOTAL).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub fn inc_call_panics() {}
