//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,meridian=debug";

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Returns `false` when a subscriber was already installed.
pub fn init_tracing() -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

/// Serve Prometheus metrics on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// A CSN was handed out; `bumped` when the wall clock had not advanced past
/// the previous one.
pub fn record_csn_generated(bumped: bool) {
    metrics::counter!("meridian_csn_generated_total", "bumped" => bumped.to_string())
        .increment(1);
}

pub fn record_csn_wal_assignment() {
    metrics::counter!("meridian_csn_wal_assignments_total").increment(1);
}

pub fn record_snapshot_too_old() {
    metrics::counter!("meridian_snapshot_too_old_total").increment(1);
}

/// A visibility check had to wait for an in-doubt transaction.
pub fn record_in_doubt_wait(wait_us: u64) {
    metrics::counter!("meridian_in_doubt_waits_total").increment(1);
    metrics::histogram!("meridian_in_doubt_wait_us").record(wait_us as f64);
}

pub fn record_deferred_xmin(xmin: u64) {
    metrics::gauge!("meridian_deferred_xmin").set(xmin as f64);
}

/// Connection cache events: `connect`, `disconnect`, `discard`, `retry`,
/// `invalidate`, `reject`.
pub fn record_connection_event(event: &str) {
    metrics::counter!("meridian_fdw_connection_events_total", "event" => event.to_string())
        .increment(1);
}

/// Foreign transaction actions: `prepare`, `commit`, `rollback`,
/// `csn_prepare`, `csn_assign`.
pub fn record_fdw_xact(action: &str, two_phase: bool, success: bool) {
    metrics::counter!(
        "meridian_fdw_xact_total",
        "action" => action.to_string(),
        "two_phase" => two_phase.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}

pub fn record_resolver_sweep(resolved: usize, failures: usize, pending: usize, sweep_us: u64) {
    metrics::counter!("meridian_fdw_resolved_total").increment(resolved as u64);
    metrics::counter!("meridian_fdw_resolution_failures_total").increment(failures as u64);
    metrics::gauge!("meridian_fdw_in_doubt").set(pending as f64);
    metrics::histogram!("meridian_fdw_resolver_sweep_us").record(sweep_us as f64);
}
