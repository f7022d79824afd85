//! Metrics collection and export for Aurora.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use aurora_protocol::{EventName, Frame};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "aurora_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "aurora_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "aurora_connections_rejected_total";
    pub const FRAMES_TOTAL: &str = "aurora_frames_total";
    pub const FRAMES_BYTES: &str = "aurora_frames_bytes";
    pub const DELIVERIES_TOTAL: &str = "aurora_deliveries_total";
    pub const USERS_ONLINE: &str = "aurora_users_online";
    pub const LATENCY_SECONDS: &str = "aurora_latency_seconds";
    pub const ERRORS_TOTAL: &str = "aurora_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Upgrade requests refused, by reason"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames, by event and direction");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames, by direction");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Delivery outcomes reported to senders"
    );
    metrics::describe_gauge!(names::USERS_ONLINE, "Users with at least one connection");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a refused upgrade.
pub fn record_rejection(reason: &'static str) {
    counter!(names::CONNECTIONS_REJECTED, "reason" => reason).increment(1);
}

/// Record a frame.
pub fn record_frame(event: EventName, bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "event" => event.as_str(), "direction" => direction)
        .increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record the delivery outcome carried by an outbound alert, if any.
pub fn record_outcome(frame: &Frame) {
    let outcome = match frame {
        Frame::SendSuccess(_) => "success",
        Frame::SendFailed(_) => "failed",
        Frame::MessageInbox(_) => "inbox",
        Frame::MessageRead(_) => "read",
        _ => return,
    };
    counter!(names::DELIVERIES_TOTAL, "outcome" => outcome).increment(1);
}

/// Update the number of online users.
pub fn set_users_online(count: usize) {
    gauge!(names::USERS_ONLINE).set(count as f64);
}

/// Record frame processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
