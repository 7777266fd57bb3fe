use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "flowkeeper";

/// Prometheus metrics for flowkeeper health and observability.
///
/// All metrics use the "flowkeeper" namespace. Agent-side metrics cover
/// connection tracking and export; aggregator-side metrics cover ingestion
/// and ClickHouse commits.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Agent ===
    /// Number of allowed connections currently tracked.
    pub connection_count: Gauge,
    /// Number of denied connections currently tracked.
    pub denied_connection_count: Gauge,
    /// Datapath events received by kind.
    pub events_received: CounterVec,
    /// Datapath events rejected by parse error type.
    pub events_rejected: CounterVec,
    /// Flow records successfully exported by store.
    pub records_exported: CounterVec,
    /// Failed export batches by store.
    pub export_errors: CounterVec,
    /// Export batch duration by store.
    pub export_duration: HistogramVec,

    // === Aggregator ===
    /// Records accepted by the ingest endpoint.
    pub records_ingested: Counter,
    /// NDJSON lines rejected by the ingest endpoint.
    pub ingest_rejected: Counter,
    /// Records currently buffered for commit.
    pub record_queue_length: Gauge,
    /// Records evicted from a full buffer.
    pub queue_dropped: Counter,
    /// Records durably committed.
    pub records_committed: Counter,
    /// Failed commit attempts.
    pub commit_errors: Counter,
    /// Batch commit duration (1ms-10s buckets).
    pub commit_duration: Histogram,
    /// ClickHouse connection state (1=connected, 0=disconnected).
    pub clickhouse_connected: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Agent ===
        let connection_count = Gauge::with_opts(
            Opts::new(
                "connection_count",
                "Number of allowed connections currently tracked.",
            )
            .namespace(NAMESPACE),
        )?;
        let denied_connection_count = Gauge::with_opts(
            Opts::new(
                "denied_connection_count",
                "Number of denied connections currently tracked.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_received = CounterVec::new(
            Opts::new(
                "events_received_total",
                "Total datapath events received by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let events_rejected = CounterVec::new(
            Opts::new(
                "events_rejected_total",
                "Total datapath events rejected by error type.",
            )
            .namespace(NAMESPACE),
            &["error_type"],
        )?;
        let records_exported = CounterVec::new(
            Opts::new(
                "records_exported_total",
                "Total flow records exported by store.",
            )
            .namespace(NAMESPACE),
            &["store"],
        )?;
        let export_errors = CounterVec::new(
            Opts::new("export_errors_total", "Total failed export batches by store.")
                .namespace(NAMESPACE),
            &["store"],
        )?;
        let export_duration = HistogramVec::new(
            HistogramOpts::new(
                "export_duration_seconds",
                "Flow export batch duration by store.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["store"],
        )?;

        // === Aggregator ===
        let records_ingested = Counter::with_opts(
            Opts::new(
                "records_ingested_total",
                "Total flow records accepted by the ingest endpoint.",
            )
            .namespace(NAMESPACE),
        )?;
        let ingest_rejected = Counter::with_opts(
            Opts::new(
                "ingest_rejected_total",
                "Total NDJSON lines rejected by the ingest endpoint.",
            )
            .namespace(NAMESPACE),
        )?;
        let record_queue_length = Gauge::with_opts(
            Opts::new(
                "record_queue_length",
                "Number of flow records buffered for commit.",
            )
            .namespace(NAMESPACE),
        )?;
        let queue_dropped = Counter::with_opts(
            Opts::new(
                "queue_dropped_total",
                "Total flow records evicted from a full buffer.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_committed = Counter::with_opts(
            Opts::new(
                "records_committed_total",
                "Total flow records committed to ClickHouse.",
            )
            .namespace(NAMESPACE),
        )?;
        let commit_errors = Counter::with_opts(
            Opts::new("commit_errors_total", "Total failed commit attempts.")
                .namespace(NAMESPACE),
        )?;
        let commit_duration = Histogram::with_opts(
            HistogramOpts::new("commit_duration_seconds", "Batch commit duration.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        let clickhouse_connected = Gauge::with_opts(
            Opts::new(
                "clickhouse_connected",
                "ClickHouse connection state (1=connected, 0=disconnected).",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(connection_count.clone()))?;
        registry.register(Box::new(denied_connection_count.clone()))?;
        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_rejected.clone()))?;
        registry.register(Box::new(records_exported.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;
        registry.register(Box::new(export_duration.clone()))?;

        registry.register(Box::new(records_ingested.clone()))?;
        registry.register(Box::new(ingest_rejected.clone()))?;
        registry.register(Box::new(record_queue_length.clone()))?;
        registry.register(Box::new(queue_dropped.clone()))?;
        registry.register(Box::new(records_committed.clone()))?;
        registry.register(Box::new(commit_errors.clone()))?;
        registry.register(Box::new(commit_duration.clone()))?;
        registry.register(Box::new(clickhouse_connected.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            connection_count,
            denied_connection_count,
            events_received,
            events_rejected,
            records_exported,
            export_errors,
            export_duration,
            records_ingested,
            ingest_rejected,
            record_queue_length,
            queue_dropped,
            records_committed,
            commit_errors,
            commit_duration,
            clickhouse_connected,
        })
    }

    /// Renders all registered metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };
        let bind_addr = bind_address(addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand to an all-interfaces bind address.
pub fn bind_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
