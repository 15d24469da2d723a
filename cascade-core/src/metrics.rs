//! Prometheus metrics of the runners and the HTTP endpoints exposing them.
//!
//! Every family is labelled by `computation` and `partition`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Response, StatusCode, header};
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

const REGISTRY_PREFIX: &str = "cascade";

const COMPUTATION_LABEL: &str = "computation";
const PARTITION_LABEL: &str = "partition";

// counters, the prometheus client appends the _total suffix
const RECORDS_PROCESSED: &str = "records_processed";
const RECORDS_PRODUCED: &str = "records_produced";
const RETRIES: &str = "retries";
const FAILURES: &str = "failures";
const RECORDS_SKIPPED: &str = "records_skipped";
const COMMITS: &str = "commits";

const HALTED: &str = "halted";

const PROCESSING_TIME: &str = "processing_time";

type Labels = Vec<(String, String)>;

/// The global register of all metrics.
struct GlobalRegistry {
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(|| GlobalRegistry {
        registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_PREFIX)),
    })
}

pub struct RunnerMetrics {
    pub records_processed: Family<Labels, Counter>,
    pub records_produced: Family<Labels, Counter>,
    pub retries: Family<Labels, Counter>,
    pub failures: Family<Labels, Counter>,
    pub records_skipped: Family<Labels, Counter>,
    pub commits: Family<Labels, Counter>,
    /// `1` while the partition is halted
    pub halted: Family<Labels, Gauge>,
    /// microseconds spent in a batch, from read to commit
    pub processing_time: Family<Labels, Histogram>,
}

impl RunnerMetrics {
    fn new() -> Self {
        let metrics = Self {
            records_processed: Family::default(),
            records_produced: Family::default(),
            retries: Family::default(),
            failures: Family::default(),
            records_skipped: Family::default(),
            commits: Family::default(),
            halted: Family::default(),
            // 100 microseconds up to ~26 seconds
            processing_time: Family::new_with_constructor(|| {
                Histogram::new(exponential_buckets(100.0, 4.0, 10))
            }),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            RECORDS_PROCESSED,
            "Records successfully handed to a computation",
            metrics.records_processed.clone(),
        );
        registry.register(
            RECORDS_PRODUCED,
            "Records appended to output streams",
            metrics.records_produced.clone(),
        );
        registry.register(
            RETRIES,
            "Retried processing attempts",
            metrics.retries.clone(),
        );
        registry.register(
            FAILURES,
            "Records or timers whose retries were exhausted",
            metrics.failures.clone(),
        );
        registry.register(
            RECORDS_SKIPPED,
            "Failed records skipped by the policy",
            metrics.records_skipped.clone(),
        );
        registry.register(
            COMMITS,
            "Offset commits of the consumer group",
            metrics.commits.clone(),
        );
        registry.register(
            HALTED,
            "1 when the partition stopped on a fatal failure",
            metrics.halted.clone(),
        );
        registry.register(
            PROCESSING_TIME,
            "Time to process a batch, in microseconds",
            metrics.processing_time.clone(),
        );
        metrics
    }
}

static RUNNER_METRICS: OnceLock<RunnerMetrics> = OnceLock::new();

pub fn runner_metrics() -> &'static RunnerMetrics {
    RUNNER_METRICS.get_or_init(RunnerMetrics::new)
}

pub fn runner_labels(computation: &str, partition: u32) -> Labels {
    vec![
        (COMPUTATION_LABEL.to_string(), computation.to_string()),
        (PARTITION_LABEL.to_string(), partition.to_string()),
    ]
}

/// Count of halted runners, shared between a processor and the readiness endpoint.
#[derive(Debug, Clone, Default)]
pub struct ProcessorHealth {
    halted: Arc<AtomicUsize>,
}

impl ProcessorHealth {
    pub(crate) fn mark_halted(&self) {
        self.halted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn halted(&self) -> usize {
        self.halted.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.halted() == 0
    }
}

pub async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = String::new();
    {
        let registry = global_registry().registry.lock();
        if let Err(e) = encode(&mut buffer, &registry) {
            error!(?e, "Encoding metrics");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    debug!(size = buffer.len(), "Exposing metrics");
    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(Body::from(buffer))
        .map(IntoResponse::into_response)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn readyz(State(health): State<ProcessorHealth>) -> impl IntoResponse {
    if health.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub fn metrics_router(health: ProcessorHealth) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(health)
}

/// Serves [metrics_router] until the token is cancelled.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health: ProcessorHealth,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("binding {addr}: {e}")))?;
    info!(%addr, "Serving metrics");
    axum::serve(listener, metrics_router(health))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Metrics(format!("serving metrics: {e}")))
}
