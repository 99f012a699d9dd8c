//! Relay metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider, which must be initialized
//! by the host application (murmur-server). Without a provider every
//! instrument is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("murmur-relay"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for envelopes processed.
pub fn envelopes_processed() -> Counter<u64> {
    meter()
        .u64_counter("relay.envelopes.processed")
        .with_description("Total envelopes processed")
        .with_unit("envelope")
        .build()
}

/// Counter for fan-out deliveries by outcome.
pub fn fanout_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("relay.fanout.deliveries")
        .with_description("Per-recipient fan-out outcomes")
        .with_unit("delivery")
        .build()
}

/// Counter for replies lost to a full or closed outbox.
pub fn replies_dropped() -> Counter<u64> {
    meter()
        .u64_counter("relay.replies.dropped")
        .with_description("Replies to the originating connection that could not be queued")
        .with_unit("envelope")
        .build()
}

/// Counter for authentication attempts.
pub fn auth_attempts() -> Counter<u64> {
    meter()
        .u64_counter("relay.auth.attempts")
        .with_description("Total connection authentication attempts")
        .with_unit("attempt")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for registered connections.
pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("relay.connections.active")
        .with_description("Current number of registered connections")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Histograms (Latency)
// ============================================================================

/// Histogram for inbound envelope dispatch latency.
pub fn dispatch_latency() -> Histogram<f64> {
    meter()
        .f64_histogram("relay.dispatch.latency")
        .with_description("Inbound envelope dispatch latency")
        .with_unit("ms")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record an envelope being processed.
pub fn record_envelope(envelope_type: &str, direction: &str) {
    envelopes_processed().add(
        1,
        &[
            KeyValue::new("type", envelope_type.to_string()),
            KeyValue::new("direction", direction.to_string()),
        ],
    );
}

/// Record one recipient's fan-out outcome.
pub fn record_delivery(envelope_type: &str, outcome: &str) {
    fanout_deliveries().add(
        1,
        &[
            KeyValue::new("type", envelope_type.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ],
    );
}

/// Record a reply the originator will never see.
pub fn record_reply_dropped(envelope_type: &str) {
    replies_dropped().add(1, &[KeyValue::new("type", envelope_type.to_string())]);
}

/// Record an authentication attempt.
pub fn record_auth_attempt(method: &str, success: bool) {
    auth_attempts().add(
        1,
        &[
            KeyValue::new("method", method.to_string()),
            KeyValue::new("result", if success { "success" } else { "failure" }),
        ],
    );
}

/// Record the registry size.
pub fn record_connection_count(count: i64) {
    connections_active().record(count, &[]);
}

/// Record dispatch latency in milliseconds.
pub fn record_dispatch_latency(latency_ms: f64, envelope_type: &str) {
    dispatch_latency().record(latency_ms, &[KeyValue::new("type", envelope_type.to_string())]);
}
