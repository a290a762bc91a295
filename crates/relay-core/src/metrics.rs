//! Connection layer metrics.
//!
//! Uses the global OpenTelemetry meter provider, which the host binary may
//! install. Without one every instrument is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

/// `path` label for calls that matched no registration.
pub const UNMATCHED_CALL: &str = "<unmatched>";
/// `path` label for calls refused before lookup.
pub const DENIED_CALL: &str = "<denied>";

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("relay-core"))
}

/// Counter for RPC calls by final outcome.
pub fn rpc_calls() -> Counter<u64> {
    meter()
        .u64_counter("relay.rpc.calls")
        .with_description("Total RPC call outcomes")
        .with_unit("call")
        .build()
}

/// Counter for route calls by response status.
pub fn route_calls() -> Counter<u64> {
    meter()
        .u64_counter("relay.route.calls")
        .with_description("Total route calls bridged over sockets")
        .with_unit("call")
        .build()
}

/// Counter for frames handed to connection transports.
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("relay.deliveries")
        .with_description("Frames queued to connections by addressing mode")
        .with_unit("frame")
        .build()
}

pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("relay.connections.active")
        .with_description("Current number of connections on this instance")
        .with_unit("connection")
        .build()
}

pub fn connections_global() -> Gauge<i64> {
    meter()
        .i64_gauge("relay.connections.global")
        .with_description("Connections summed across all instances")
        .with_unit("connection")
        .build()
}

/// Histogram for RPC handler latency.
pub fn rpc_latency() -> Histogram<f64> {
    meter()
        .f64_histogram("relay.rpc.latency")
        .with_description("RPC handler latency")
        .with_unit("ms")
        .build()
}

pub fn record_rpc_outcome(path: &str, outcome: &str) {
    rpc_calls().add(
        1,
        &[
            KeyValue::new("path", path.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ],
    );
}

pub fn record_rpc_latency(path: &str, latency_ms: f64) {
    rpc_latency().record(latency_ms, &[KeyValue::new("path", path.to_string())]);
}

/// Bounded `method` label for route calls.
pub fn method_label(method: &str) -> &'static str {
    const KNOWN: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];
    KNOWN
        .into_iter()
        .find(|known| known.eq_ignore_ascii_case(method))
        .unwrap_or("OTHER")
}

pub fn record_route_status(method: &str, status: u16) {
    route_calls().add(
        1,
        &[
            KeyValue::new("method", method_label(method)),
            KeyValue::new("status", i64::from(status)),
        ],
    );
}

pub fn record_deliveries(mode: &'static str, count: usize) {
    deliveries().add(count as u64, &[KeyValue::new("mode", mode)]);
}

pub fn record_connection_counts(local: u64, global: u64) {
    connections_active().record(local as i64, &[]);
    connections_global().record(global as i64, &[]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_label_is_bounded() {
        assert_eq!(method_label("get"), "GET");
        assert_eq!(method_label("Delete"), "DELETE");
        assert_eq!(method_label("BREW"), "OTHER");
        assert_eq!(method_label(""), "OTHER");
    }
}
