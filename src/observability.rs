use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "lessond_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "lessond_http_request_duration_seconds";

/// Counter: requests shed because the in-flight limit was reached.
pub const HTTP_REQUESTS_REJECTED_TOTAL: &str = "lessond_http_requests_rejected_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: lesson requests accepted.
pub const BOOKINGS_CREATED_TOTAL: &str = "lessond_bookings_created_total";

/// Counter: lesson requests refused for time reasons. Labels: code.
pub const BOOKING_CONFLICTS_TOTAL: &str = "lessond_booking_conflicts_total";

/// Counter: status changes. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "lessond_booking_transitions_total";

/// Counter: pending requests moved to expired by the sweeper.
pub const BOOKINGS_EXPIRED_TOTAL: &str = "lessond_bookings_expired_total";

/// Counter: pending requests declined because their window was removed.
pub const CASCADE_DECLINED_TOTAL: &str = "lessond_cascade_declined_total";

/// Counter: booking messages posted.
pub const MESSAGES_SENT_TOTAL: &str = "lessond_messages_sent_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open realtime streams.
pub const REALTIME_STREAMS_ACTIVE: &str = "lessond_realtime_streams_active";

/// Gauge: number of active studios (loaded engines).
pub const TENANTS_ACTIVE: &str = "lessond_tenants_active";

/// Counter: rejected identities and sweep tokens. Labels: reason.
pub const AUTH_FAILURES_TOTAL: &str = "lessond_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lessond_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lessond_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
