//! Metrics collection and export for FleetHub.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use fleethub_core::{ConnectionStats, RouterError};
use fleethub_protocol::EventKind;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "fleethub_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "fleethub_connections_active";
    pub const DRIVER_BINDINGS: &str = "fleethub_driver_bindings";
    pub const EVENTS_TOTAL: &str = "fleethub_events_total";
    pub const BROADCAST_RECIPIENTS: &str = "fleethub_broadcast_recipients";
    pub const DISPATCH_LATENCY_SECONDS: &str = "fleethub_dispatch_latency_seconds";
    pub const ERRORS_TOTAL: &str = "fleethub_errors_total";
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
    metrics::describe_gauge!(
        names::DRIVER_BINDINGS,
        "Drivers currently bound to a connection"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Inbound events by name");
    metrics::describe_histogram!(
        names::BROADCAST_RECIPIENTS,
        "Recipients per broadcast or group send"
    );
    metrics::describe_histogram!(
        names::DISPATCH_LATENCY_SECONDS,
        "Inbound event dispatch latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

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

/// Record an inbound event.
pub fn record_event(kind: EventKind) {
    counter!(names::EVENTS_TOTAL, "event" => kind.as_str()).increment(1);
}

/// Record how many connections a fan-out reached.
pub fn record_broadcast(recipients: usize) {
    histogram!(names::BROADCAST_RECIPIENTS).record(recipients as f64);
}

/// Record dispatch latency.
pub fn record_dispatch_latency(seconds: f64) {
    histogram!(names::DISPATCH_LATENCY_SECONDS).record(seconds);
}

/// Update the driver binding gauge.
pub fn set_driver_bindings(count: usize) {
    gauge!(names::DRIVER_BINDINGS).set(count as f64);
}

/// Sink for the stats reporter.
///
/// `fleethub_connections_active` is owned by [`ConnectionMetricsGuard`] and is
/// left alone here.
pub fn record_stats(stats: &ConnectionStats) {
    set_driver_bindings(stats.driver_bindings);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Error label for a rejected event.
#[must_use]
pub fn router_error_type(error: &RouterError) -> &'static str {
    match error {
        RouterError::NotAuthenticated => "not_authenticated",
        RouterError::InvalidDriverId(_) => "invalid_driver_id",
        RouterError::MissingAssignmentTarget => "missing_assignment_target",
        RouterError::UnknownConnection(_) => "unknown_connection",
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder is installed; this only checks nothing panics.
        let _guard = ConnectionMetricsGuard::new();
        record_event(EventKind::DriverLocationUpdate);
        record_broadcast(3);
        record_stats(&ConnectionStats::default());
    }

    fn gauge_value(rendered: &str, name: &str) -> Option<f64> {
        rendered.lines().find_map(|line| {
            let value = line.strip_prefix(name)?.strip_prefix(' ')?;
            value.trim().parse().ok()
        })
    }

    #[test]
    fn test_active_connections_follow_guards_only() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let _first = ConnectionMetricsGuard::new();
            let second = ConnectionMetricsGuard::new();
            drop(second);

            record_stats(&ConnectionStats {
                active_connections: 7,
                lifetime_connections: 9,
                driver_bindings: 3,
            });
        });

        let rendered = handle.render();
        assert_eq!(gauge_value(&rendered, names::CONNECTIONS_ACTIVE), Some(1.0));
        assert_eq!(gauge_value(&rendered, names::DRIVER_BINDINGS), Some(3.0));
    }

    #[test]
    fn test_router_error_labels() {
        assert_eq!(
            router_error_type(&RouterError::NotAuthenticated),
            "not_authenticated"
        );
        assert_eq!(
            router_error_type(&RouterError::InvalidDriverId("Driver id cannot be empty")),
            "invalid_driver_id"
        );
    }
}
