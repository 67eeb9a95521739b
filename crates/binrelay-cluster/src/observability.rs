//! Metrics for cluster coordination
//!
//! Thin wrappers over the `metrics` crate. With the `metrics-prometheus`
//! feature disabled every call compiles to nothing.
//!
//! ```rust,ignore
//! use binrelay_cluster::observability::{init_metrics, MetadataMetrics};
//!
//! init_metrics(Some("0.0.0.0:9090".parse()?))?;
//! MetadataMetrics::record_write("pipeline", "update", true);
//! ```

use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Election Metrics
// ============================================================================

/// Leader election metrics
pub struct ElectionMetrics;

impl ElectionMetrics {
    /// Campaigns started by this node
    pub fn record_campaign() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("binrelay_election_campaigns_total").increment(1);
    }

    /// Whether this node is the leader (1 = yes, 0 = no)
    pub fn set_leader(is_leader: bool) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("binrelay_election_is_leader").set(if is_leader { 1.0 } else { 0.0 });
        #[cfg(feature = "metrics-prometheus")]
        if is_leader {
            metrics::counter!("binrelay_election_leadership_acquired_total").increment(1);
        }
    }
}

// ============================================================================
// Metadata Metrics
// ============================================================================

/// Replicated metadata metrics
pub struct MetadataMetrics;

impl MetadataMetrics {
    /// Cascaded writes, labelled by kind, operation and outcome
    pub fn record_write(kind: &str, op: &'static str, ok: bool) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!(
            "binrelay_metadata_writes_total",
            "kind" => kind.to_string(),
            "op" => op,
            "result" => if ok { "ok" } else { "error" }
        )
        .increment(1);
    }

    /// Writes rejected because the remote version moved
    pub fn increment_conflicts(kind: &str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("binrelay_metadata_conflicts_total", "kind" => kind.to_string())
            .increment(1);
    }

    /// Entities fetched from the remote store into the local cache
    pub fn add_refreshed(kind: &str, count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("binrelay_metadata_refreshed_total", "kind" => kind.to_string())
            .increment(count as u64);
    }

    /// Local copies dropped because the remote entity is gone
    pub fn add_evicted(kind: &str, count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("binrelay_metadata_evicted_total", "kind" => kind.to_string())
            .increment(count as u64);
    }

    /// Ids skipped by a reconciliation pass after an error
    pub fn add_refresh_failures(kind: &str, count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("binrelay_metadata_refresh_failures_total", "kind" => kind.to_string())
            .increment(count as u64);
    }

    /// Writes recorded locally but not yet confirmed remotely
    pub fn set_pending_intents(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("binrelay_metadata_pending_intents").set(count as f64);
    }

    /// Duration of a full refresh of one kind
    pub fn record_refresh_duration(kind: &str, duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!(
            "binrelay_metadata_refresh_duration_seconds",
            "kind" => kind.to_string()
        )
        .record(duration.as_secs_f64());
    }
}

// ============================================================================
// Run-State Metrics
// ============================================================================

/// Pipeline run-state metrics
pub struct RunStateMetrics;

impl RunStateMetrics {
    pub fn increment_state_writes() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("binrelay_run_state_state_writes_total").increment(1);
    }

    pub fn increment_position_writes() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("binrelay_run_state_position_writes_total").increment(1);
    }

    /// Latency of a remote run-state call
    pub fn record_remote_latency(op: &'static str, duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("binrelay_run_state_remote_latency_seconds", "op" => op)
            .record(duration.as_secs_f64());
    }
}

// ============================================================================
// Prometheus Backend (when enabled)
// ============================================================================

#[cfg(feature = "metrics-prometheus")]
mod prom {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    /// Install the Prometheus recorder and serve `/metrics` on `addr`
    pub fn init_prometheus_exporter(
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new().with_http_listener(addr).install()?;

        tracing::info!("Prometheus metrics exporter listening on http://{}/metrics", addr);
        Ok(())
    }

    /// Install the recorder only, for embedding in an existing server
    pub fn init_prometheus_recorder() -> Result<
        metrics_exporter_prometheus::PrometheusHandle,
        Box<dyn std::error::Error + Send + Sync>,
    > {
        let handle = PrometheusBuilder::new().install_recorder()?;
        Ok(handle)
    }
}

#[cfg(feature = "metrics-prometheus")]
pub use prom::{init_prometheus_exporter, init_prometheus_recorder};

// ============================================================================
// Unified Initialization
// ============================================================================

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the metrics subsystem; safe to call more than once
pub fn init_metrics(
    prometheus_addr: Option<std::net::SocketAddr>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    METRICS_INITIALIZED.get_or_init(|| {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(addr) = prometheus_addr {
            if let Err(e) = init_prometheus_exporter(addr) {
                tracing::error!("Failed to start Prometheus exporter: {}", e);
            }
        }
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = prometheus_addr;

        tracing::info!(
            prometheus = cfg!(feature = "metrics-prometheus"),
            "Metrics subsystem initialized"
        );
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_calls_without_recorder() {
        ElectionMetrics::record_campaign();
        ElectionMetrics::set_leader(true);
        ElectionMetrics::set_leader(false);
        MetadataMetrics::record_write("source", "insert", true);
        MetadataMetrics::add_refresh_failures("source", 1);
        MetadataMetrics::increment_conflicts("pipeline");
        MetadataMetrics::add_refreshed("endpoint", 3);
        MetadataMetrics::set_pending_intents(0);
        MetadataMetrics::record_refresh_duration("source", Duration::from_millis(5));
        RunStateMetrics::increment_state_writes();
        RunStateMetrics::record_remote_latency("state_update", Duration::from_micros(200));
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics(None).unwrap();
        init_metrics(None).unwrap();
    }
}
