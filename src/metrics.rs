//! Prometheus metrics for the depot scheduler.
//!
//! This module provides:
//! - Pre-defined metric instruments for job state transitions, timeouts and pruning
//! - An HTTP server for the `/metrics` endpoint
//!
//! # Usage
//!
//! ```ignore
//! let metrics = depot::metrics::init()?;
//! let state = State::open_with(cfg, Registry::standard(), observers, Some(metrics.clone())).await?;
//! depot::metrics::run_metrics_server(addr, metrics, shutdown_rx).await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    core::Collector, Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Histogram buckets for assignment waits (in seconds). Runners may park for a long time.
const WAIT_TIME_BUCKETS: &[f64] = &[
    0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0,
];

/// Metrics handle containing all metric instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    jobs_queued: CounterVec,
    jobs_assigned: CounterVec,
    jobs_completed: CounterVec,
    job_timeouts: CounterVec,
    jobs_cascaded: Counter,
    records_pruned: CounterVec,
    index_size: GaugeVec,
    assign_wait_time: HistogramVec,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a job entering the queue, labelled by operation kind.
    pub fn record_queued(&self, operation: &str) {
        self.jobs_queued.with_label_values(&[operation]).inc();
    }

    /// Record a job assigned to a runner; `strategy` is the target variant that matched.
    pub fn record_assigned(&self, strategy: &str) {
        self.jobs_assigned.with_label_values(&[strategy]).inc();
    }

    /// Record a job reaching a terminal state ("success" or "error").
    pub fn record_completion(&self, state: &str) {
        self.jobs_completed.with_label_values(&[state]).inc();
    }

    pub fn record_timeout(&self, kind: &str) {
        self.job_timeouts.with_label_values(&[kind]).inc();
    }

    pub fn record_cascaded(&self, count: u64) {
        self.jobs_cascaded.inc_by(count as f64);
    }

    pub fn record_pruned(&self, table: &str, count: u64) {
        self.records_pruned
            .with_label_values(&[table])
            .inc_by(count as f64);
    }

    pub fn set_index_size(&self, table: &str, size: u64) {
        self.index_size.with_label_values(&[table]).set(size as f64);
    }

    /// Record how long a runner waited in assignment before getting a job (or giving up).
    pub fn record_assign_wait(&self, outcome: &str, wait_secs: f64) {
        self.assign_wait_time
            .with_label_values(&[outcome])
            .observe(wait_secs);
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Initialize the metrics system with a fresh Prometheus registry.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let jobs_queued = register(
        &registry,
        CounterVec::new(
            Opts::new("depot_jobs_queued_total", "Total number of jobs queued"),
            &["operation"],
        )?,
    );

    let jobs_assigned = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "depot_jobs_assigned_total",
                "Total number of jobs assigned to runners",
            ),
            &["strategy"],
        )?,
    );

    let jobs_completed = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "depot_jobs_completed_total",
                "Total number of jobs that reached a terminal state",
            ),
            &["state"],
        )?,
    );

    let job_timeouts = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "depot_job_timeouts_total",
                "Timeout-driven job transitions (ack timeout, heartbeat, expiry)",
            ),
            &["kind"],
        )?,
    );

    let jobs_cascaded = register(
        &registry,
        Counter::new(
            "depot_jobs_cascaded_total",
            "Jobs errored because a dependency errored",
        )?,
    );

    let records_pruned = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "depot_records_pruned_total",
                "Records dropped from the memory index",
            ),
            &["table"],
        )?,
    );

    let index_size = register(
        &registry,
        GaugeVec::new(
            Opts::new("depot_index_size", "Number of rows in each memory table"),
            &["table"],
        )?,
    );

    let assign_wait_time = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "depot_assign_wait_seconds",
                "Time runners spent waiting for an assignable job",
            )
            .buckets(WAIT_TIME_BUCKETS.to_vec()),
            &["outcome"],
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        jobs_queued,
        jobs_assigned,
        jobs_completed,
        job_timeouts,
        jobs_cascaded,
        records_pruned,
        index_size,
        assign_wait_time,
    })
}

/// Axum handler for the `/metrics` endpoint.
async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Run the Prometheus metrics HTTP server until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
