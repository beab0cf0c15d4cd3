//! Prometheus metrics and the exposition endpoint
//!
//! Metrics live on an instance-scoped registry rather than the process
//! global so tests can build as many collectors as they need without
//! duplicate-registration panics. The HTTP surface serves the text
//! exposition plus the usual healthz/readyz probes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Gauge, GaugeVec, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Error;

/// Outcome label recorded on drain, cordon, and scale counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation completed
    Success,
    /// The operation failed
    Failure,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// Collector for every metric the controller exposes
pub struct Metrics {
    registry: Registry,
    pub(crate) node_health: GaugeVec,
    pub(crate) node_count: IntGauge,
    pub(crate) drain_total: IntCounterVec,
    pub(crate) cordon_total: IntCounterVec,
    pub(crate) scale_total: IntCounterVec,
    pub(crate) cluster_cpu: Gauge,
    pub(crate) cluster_memory: Gauge,
    pub(crate) reconcile_duration: Histogram,
}

impl Metrics {
    /// Create the collector and register everything on a fresh registry
    pub fn new() -> Result<Self, Error> {
        let registry = Registry::new();

        let node_health = GaugeVec::new(
            Opts::new(
                "node_lifecycle_health_status",
                "Health status of nodes (1 = healthy, 0 = unhealthy)",
            ),
            &["node"],
        )
        .map_err(internal)?;
        let node_count = IntGauge::new(
            "node_lifecycle_node_count",
            "Total number of nodes in the cluster",
        )
        .map_err(internal)?;
        let drain_total = IntCounterVec::new(
            Opts::new(
                "node_lifecycle_drain_total",
                "Total number of node drain operations",
            ),
            &["node", "result"],
        )
        .map_err(internal)?;
        let cordon_total = IntCounterVec::new(
            Opts::new(
                "node_lifecycle_cordon_total",
                "Total number of node cordon operations",
            ),
            &["node", "result"],
        )
        .map_err(internal)?;
        let scale_total = IntCounterVec::new(
            Opts::new(
                "node_lifecycle_scale_total",
                "Total number of scaling operations",
            ),
            &["nodepool", "direction", "result"],
        )
        .map_err(internal)?;
        let cluster_cpu = Gauge::new(
            "node_lifecycle_cluster_cpu_utilization",
            "Cluster CPU utilization as a fraction of capacity",
        )
        .map_err(internal)?;
        let cluster_memory = Gauge::new(
            "node_lifecycle_cluster_memory_utilization",
            "Cluster memory utilization as a fraction of capacity",
        )
        .map_err(internal)?;
        let reconcile_duration = Histogram::with_opts(HistogramOpts::new(
            "node_lifecycle_reconcile_duration_seconds",
            "Duration of reconciliation loops",
        ))
        .map_err(internal)?;

        for collector in [
            Box::new(node_health.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(node_count.clone()),
            Box::new(drain_total.clone()),
            Box::new(cordon_total.clone()),
            Box::new(scale_total.clone()),
            Box::new(cluster_cpu.clone()),
            Box::new(cluster_memory.clone()),
            Box::new(reconcile_duration.clone()),
        ] {
            registry.register(collector).map_err(internal)?;
        }

        Ok(Self {
            registry,
            node_health,
            node_count,
            drain_total,
            cordon_total,
            scale_total,
            cluster_cpu,
            cluster_memory,
            reconcile_duration,
        })
    }

    /// Record a node's health as 1 (healthy) or 0 (unhealthy)
    pub fn set_node_health(&self, node: &str, healthy: bool) {
        let value = if healthy { 1.0 } else { 0.0 };
        self.node_health.with_label_values(&[node]).set(value);
    }

    /// Drop the health series for a node that left the cluster
    pub fn forget_node(&self, node: &str) {
        let _ = self.node_health.remove_label_values(&[node]);
    }

    /// Record the current node count
    pub fn set_node_count(&self, count: usize) {
        self.node_count.set(count as i64);
    }

    /// Count one drain attempt
    pub fn inc_drain(&self, node: &str, outcome: Outcome) {
        self.drain_total
            .with_label_values(&[node, outcome.as_str()])
            .inc();
    }

    /// Count one cordon attempt
    pub fn inc_cordon(&self, node: &str, outcome: Outcome) {
        self.cordon_total
            .with_label_values(&[node, outcome.as_str()])
            .inc();
    }

    /// Count one scale attempt in the given direction
    pub fn inc_scale(&self, pool: &str, direction: &str, outcome: Outcome) {
        self.scale_total
            .with_label_values(&[pool, direction, outcome.as_str()])
            .inc();
    }

    /// Record cluster utilisation fractions
    pub fn set_cluster_utilization(&self, cpu: f64, memory: f64) {
        self.cluster_cpu.set(cpu);
        self.cluster_memory.set(memory);
    }

    /// Record the wall-clock duration of one reconciliation tick
    pub fn observe_reconcile_duration(&self, seconds: f64) {
        self.reconcile_duration.observe(seconds);
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_else(|e| {
                error!(error = %e, "failed to encode metrics");
                String::new()
            })
    }
}

fn internal(e: prometheus::Error) -> Error {
    Error::internal(format!("register metrics: {e}"))
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics.render(),
    )
}

async fn ok_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Build the metrics/probe router
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(ok_handler))
        .route("/readyz", get(ok_handler))
        .with_state(metrics)
}

/// Serve the metrics endpoint until the token is cancelled
pub async fn serve(
    addr: &str,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let app = router(metrics);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal(format!("bind metrics listener on {addr}: {e}")))?;

    info!(addr = %addr, "metrics server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::internal(format!("metrics server: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_renders_all_series() {
        let metrics = Metrics::new().unwrap();
        metrics.set_node_health("node-a", true);
        metrics.set_node_health("node-b", false);
        metrics.set_node_count(2);
        metrics.inc_drain("node-b", Outcome::Success);
        metrics.inc_cordon("node-b", Outcome::Failure);
        metrics.inc_scale("workers", "up", Outcome::Success);
        metrics.set_cluster_utilization(0.42, 0.58);
        metrics.observe_reconcile_duration(0.005);

        let text = metrics.render();
        assert!(text.contains("node_lifecycle_health_status{node=\"node-a\"} 1"));
        assert!(text.contains("node_lifecycle_health_status{node=\"node-b\"} 0"));
        assert!(text.contains("node_lifecycle_node_count 2"));
        assert!(text.contains("node_lifecycle_drain_total{node=\"node-b\",result=\"success\"} 1"));
        assert!(text.contains("node_lifecycle_cordon_total{node=\"node-b\",result=\"failure\"} 1"));
        assert!(text.contains(
            "node_lifecycle_scale_total{direction=\"up\",nodepool=\"workers\",result=\"success\"} 1"
        ));
        assert!(text.contains("node_lifecycle_cluster_cpu_utilization 0.42"));
        assert!(text.contains("node_lifecycle_cluster_memory_utilization 0.58"));
        assert!(text.contains("node_lifecycle_reconcile_duration_seconds_count 1"));
    }

    #[test]
    fn forgetting_a_node_drops_its_series() {
        let metrics = Metrics::new().unwrap();
        metrics.set_node_health("node-a", true);
        metrics.forget_node("node-a");
        assert!(!metrics.render().contains("node=\"node-a\""));
    }

    #[test]
    fn collectors_are_independent_per_instance() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.inc_drain("node-x", Outcome::Success);
        assert!(!b.render().contains("node_lifecycle_drain_total{"));
    }
}
