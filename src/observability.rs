use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: line-protocol requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotkeeper_requests_total";

/// Histogram: line-protocol request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotkeeper_request_duration_seconds";

/// Counter: engine operations. Labels: op, outcome.
pub const ENGINE_OPERATIONS_TOTAL: &str = "slotkeeper_engine_operations_total";

/// Histogram: engine operation latency in seconds. Labels: op.
pub const ENGINE_OPERATION_DURATION_SECONDS: &str = "slotkeeper_engine_operation_duration_seconds";

/// Histogram: time spent waiting for a resource's exclusive section.
pub const LOCK_WAIT_SECONDS: &str = "slotkeeper_lock_wait_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotkeeper_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotkeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotkeeper_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

// ── Periodic statistics ─────────────────────────────────────────

/// Gauge: bookings ever created.
pub const BOOKINGS_TOTAL: &str = "slotkeeper_bookings_total";

/// Gauge: pending plus confirmed bookings.
pub const BOOKINGS_ACTIVE: &str = "slotkeeper_bookings_active";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a request to a short label for metrics.
pub fn request_label(request: &Request) -> &'static str {
    match request {
        Request::Reserve(_) => "reserve",
        Request::Get { .. } => "get",
        Request::Cancel { .. } => "cancel",
        Request::Confirm { .. } => "confirm",
        Request::ListByRequester { .. } => "list_by_requester",
        Request::ListByResource { .. } => "list_by_resource",
        Request::ListAll => "list_all",
        Request::Stats => "stats",
        Request::Ping => "ping",
    }
}
