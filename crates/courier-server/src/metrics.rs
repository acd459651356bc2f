//! Metrics collection and export for courier.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const POLLS_TOTAL: &str = "courier_polls_total";
    pub const CLIENTS_WAITING: &str = "courier_clients_waiting";
    pub const POLL_DURATION_SECONDS: &str = "courier_poll_duration_seconds";
    pub const PUBLISHES_TOTAL: &str = "courier_publishes_total";
    pub const PUBLISHED_BYTES: &str = "courier_published_bytes";
    pub const DELIVERIES_TOTAL: &str = "courier_deliveries_total";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(names::POLLS_TOTAL, "Total number of long-poll requests");
    metrics::describe_gauge!(
        names::CLIENTS_WAITING,
        "Current number of clients waiting for messages"
    );
    metrics::describe_histogram!(
        names::POLL_DURATION_SECONDS,
        "Time from poll arrival to response in seconds"
    );
    metrics::describe_counter!(names::PUBLISHES_TOTAL, "Total number of published messages");
    metrics::describe_counter!(names::PUBLISHED_BYTES, "Total bytes of published payloads");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Total number of messages handed to waiting clients"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a long-poll request.
pub fn record_poll() {
    counter!(names::POLLS_TOTAL).increment(1);
}

/// Record how long a poll was held.
pub fn record_poll_duration(elapsed: Duration) {
    histogram!(names::POLL_DURATION_SECONDS).record(elapsed.as_secs_f64());
}

/// Update the waiting client count.
pub fn set_waiting_clients(count: usize) {
    gauge!(names::CLIENTS_WAITING).set(count as f64);
}

/// Record a publish.
pub fn record_publish(bytes: usize) {
    counter!(names::PUBLISHES_TOTAL).increment(1);
    counter!(names::PUBLISHED_BYTES).increment(bytes as u64);
}

/// Record messages handed to clients.
pub fn record_deliveries(count: usize, source: &str) {
    counter!(names::DELIVERIES_TOTAL, "source" => source.to_string()).increment(count as u64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        // Without an installed recorder every call is a no-op.
        record_poll();
        record_poll_duration(Duration::from_millis(5));
        set_waiting_clients(3);
        record_publish(64);
        record_deliveries(2, "live");
        record_error("store");
    }
}
