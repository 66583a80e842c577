//! Metrics emitted by the discovery server.
//!
//! Everything goes through the `metrics` facade; installing a recorder is
//! left to the binary.

use std::time::Duration;

use crate::resource::short_name;

/// A request acknowledged a nonce other than the last one sent.
pub(crate) fn expired_nonce(type_url: &str) {
    metrics::counter!("xds_expired_nonce_total", "type" => short_name(type_url)).increment(1);
}

/// A proxy rejected a response.
pub(crate) fn reject(type_url: &str, code: i32) {
    metrics::counter!(
        "xds_rejects_total",
        "type" => short_name(type_url),
        "code" => code.to_string(),
    )
    .increment(1);
}

/// A push was parked by flow control.
pub(crate) fn delayed_push(type_url: &str) {
    metrics::counter!("xds_delayed_pushes_total", "type" => short_name(type_url)).increment(1);
}

/// A response could not be written within the send timeout.
pub(crate) fn write_timeout() {
    metrics::counter!("xds_write_timeouts_total").increment(1);
}

/// Unexpected receive or push failure.
pub(crate) fn internal_error() {
    metrics::counter!("xds_internal_errors_total").increment(1);
}

/// A generator failed.
pub(crate) fn generate_error(type_url: &str) {
    metrics::counter!("xds_generate_errors_total", "type" => short_name(type_url)).increment(1);
}

/// A response was sent.
pub(crate) fn push(type_url: &str, size: usize) {
    let kind = short_name(type_url);
    metrics::counter!("xds_pushes_total", "type" => kind).increment(1);
    metrics::histogram!("xds_config_size_bytes", "type" => kind).record(size as f64);
}

/// Time from the first change behind a push to the response leaving.
pub(crate) fn push_latency(type_url: &str, elapsed: Duration) {
    metrics::histogram!("xds_push_latency_seconds", "type" => short_name(type_url))
        .record(elapsed.as_secs_f64());
}

/// Number of connected proxies.
pub(crate) fn connected_proxies(count: usize) {
    metrics::gauge!("xds_connected_proxies").set(count as f64);
}

/// How long a debounce window held changes back.
pub(crate) fn debounce_time(elapsed: Duration, events: usize) {
    metrics::histogram!("xds_debounce_seconds").record(elapsed.as_secs_f64());
    metrics::histogram!("xds_debounce_events").record(events as f64);
}

/// Time to build a push context.
pub(crate) fn push_context_init(elapsed: Duration) {
    metrics::histogram!("xds_push_context_init_seconds").record(elapsed.as_secs_f64());
}

/// Outcome of applying an EnvoyFilter's patches at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStatus {
    /// At least one patch matched and applied.
    Applied,
    /// Patch application failed and the input was kept.
    Error,
}

impl PatchStatus {
    fn as_str(self) -> &'static str {
        match self {
            PatchStatus::Applied => "applied",
            PatchStatus::Error => "error",
        }
    }
}

/// Record the outcome of an EnvoyFilter at one patch level.
pub fn record_envoy_filter(filter_key: &str, apply_to: &'static str, status: PatchStatus) {
    metrics::counter!(
        "xds_envoy_filter_status_total",
        "filter" => filter_key.to_string(),
        "apply_to" => apply_to,
        "status" => status.as_str(),
    )
    .increment(1);
}
