//! Metrics collection and export for the collab server.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use collab_core::{ConnectionManager, DispatchSnapshot, ProjectDirectory};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "collab_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "collab_connections_active";
    pub const MESSAGES_TOTAL: &str = "collab_messages_total";
    pub const MESSAGES_BYTES: &str = "collab_messages_bytes";
    pub const UPDATES_TOTAL: &str = "collab_updates_total";
    pub const PROJECTS_ACTIVE: &str = "collab_projects_active";
    pub const QUEUE_DEPTH: &str = "collab_queue_depth";
    pub const DISPATCHED_TOTAL: &str = "collab_dispatched_packets_total";
    pub const DELIVERIES_TOTAL: &str = "collab_deliveries_total";
    pub const ERRORS_TOTAL: &str = "collab_errors_total";
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
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(names::UPDATES_TOTAL, "Total number of updates queued");
    metrics::describe_gauge!(names::PROJECTS_ACTIVE, "Current number of projects with members");
    metrics::describe_gauge!(names::QUEUE_DEPTH, "Packets waiting for the dispatch loop");
    metrics::describe_counter!(names::DISPATCHED_TOTAL, "Packets fanned out by the dispatch loop");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Per-recipient fan-out results by outcome"
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

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record an update accepted into the dispatch queue.
pub fn record_update() {
    counter!(names::UPDATES_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish the manager's current totals.
pub fn record_dispatch(snapshot: &DispatchSnapshot, queue_depth: usize, projects: usize) {
    gauge!(names::QUEUE_DEPTH).set(queue_depth as f64);
    gauge!(names::PROJECTS_ACTIVE).set(projects as f64);
    counter!(names::DISPATCHED_TOTAL).absolute(snapshot.packets);
    counter!(names::DELIVERIES_TOTAL, "outcome" => "forwarded").absolute(snapshot.forwarded);
    counter!(names::DELIVERIES_TOTAL, "outcome" => "acknowledged").absolute(snapshot.acknowledged);
    counter!(names::DELIVERIES_TOTAL, "outcome" => "filtered").absolute(snapshot.filtered);
    counter!(names::DELIVERIES_TOTAL, "outcome" => "failed").absolute(snapshot.failed);
}

/// Sample the manager every `period` until it is terminated.
pub fn spawn_sampler(manager: Arc<ConnectionManager>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        while !manager.is_done() {
            ticker.tick().await;
            record_dispatch(
                &manager.dispatch_stats(),
                manager.queue_depth(),
                manager.projects().project_count(),
            );
        }
        debug!("Metrics sampler stopped");
    })
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
