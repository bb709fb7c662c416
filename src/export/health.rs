use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "hpxdash";

/// Prometheus metrics for the ingestion server.
///
/// All metrics use the "hpxdash" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    bound: parking_lot::Mutex<Option<SocketAddr>>,

    // === Transport ===
    /// Decoded messages by tag.
    pub messages_received: CounterVec,
    /// Frames dropped by the codec, by error type.
    pub protocol_errors: CounterVec,
    /// Currently connected agents.
    pub connections_active: Gauge,
    /// Messages waiting in the ingestion queue.
    pub queue_depth: Gauge,
    /// Capacity of the ingestion queue.
    pub queue_capacity: Gauge,

    // === Ingestion ===
    /// Classified records received, by record kind.
    pub lines_classified: CounterVec,
    /// Records dropped because no run was live.
    pub records_dropped: Counter,
    /// Rejected lifecycle messages by error type.
    pub ingest_errors: CounterVec,
    /// Time to apply one message to the store.
    pub ingest_duration: Histogram,

    // === Runs ===
    pub runs_started: Counter,
    pub runs_finalized: Counter,
    /// Whether a run is live (1=yes, 0=no).
    pub run_live: Gauge,
    /// Runs written to the session directory.
    pub runs_saved: Counter,
    /// Failed session writes. Auto-save stops after the first one.
    pub persistence_errors: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Transport ===
        let messages_received = CounterVec::new(
            Opts::new(
                "messages_received_total",
                "Total transport messages decoded by tag.",
            )
            .namespace(NAMESPACE),
            &["tag"],
        )?;
        let protocol_errors = CounterVec::new(
            Opts::new(
                "protocol_errors_total",
                "Total frames dropped by error type.",
            )
            .namespace(NAMESPACE),
            &["error_type"],
        )?;
        let connections_active = Gauge::with_opts(
            Opts::new("connections_active", "Number of connected agents.").namespace(NAMESPACE),
        )?;
        let queue_depth = Gauge::with_opts(
            Opts::new(
                "ingestion_queue_depth",
                "Messages waiting in the ingestion queue.",
            )
            .namespace(NAMESPACE),
        )?;
        let queue_capacity = Gauge::with_opts(
            Opts::new(
                "ingestion_queue_capacity",
                "Capacity of the ingestion queue.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Ingestion ===
        let lines_classified = CounterVec::new(
            Opts::new(
                "lines_classified_total",
                "Total classified records received by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let records_dropped = Counter::with_opts(
            Opts::new(
                "records_dropped_total",
                "Total records dropped because no run was live.",
            )
            .namespace(NAMESPACE),
        )?;
        let ingest_errors = CounterVec::new(
            Opts::new(
                "ingest_errors_total",
                "Total rejected lifecycle messages by error type.",
            )
            .namespace(NAMESPACE),
            &["error_type"],
        )?;
        let ingest_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ingest_duration_seconds",
                "Time to apply one message to the store.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]),
        )?;

        // === Runs ===
        let runs_started = Counter::with_opts(
            Opts::new("runs_started_total", "Total runs started.").namespace(NAMESPACE),
        )?;
        let runs_finalized = Counter::with_opts(
            Opts::new("runs_finalized_total", "Total runs finalized.").namespace(NAMESPACE),
        )?;
        let run_live = Gauge::with_opts(
            Opts::new("run_live", "Whether a run is live (1=yes, 0=no).").namespace(NAMESPACE),
        )?;
        let runs_saved = Counter::with_opts(
            Opts::new("runs_saved_total", "Total runs written to disk.").namespace(NAMESPACE),
        )?;
        let persistence_errors = Counter::with_opts(
            Opts::new(
                "persistence_errors_total",
                "Total failed session writes.",
            )
            .namespace(NAMESPACE),
        )?;

        // Register all metrics with the custom registry.
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(protocol_errors.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(queue_capacity.clone()))?;

        registry.register(Box::new(lines_classified.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(ingest_errors.clone()))?;
        registry.register(Box::new(ingest_duration.clone()))?;

        registry.register(Box::new(runs_started.clone()))?;
        registry.register(Box::new(runs_finalized.clone()))?;
        registry.register(Box::new(run_live.clone()))?;
        registry.register(Box::new(runs_saved.clone()))?;
        registry.register(Box::new(persistence_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            bound: parking_lot::Mutex::new(None),
            messages_received,
            protocol_errors,
            connections_active,
            queue_depth,
            queue_capacity,
            lines_classified,
            records_dropped,
            ingest_errors,
            ingest_duration,
            runs_started,
            runs_finalized,
            run_live,
            runs_saved,
            persistence_errors,
        })
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Address the HTTP server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    /// Starts the HTTP server serving /metrics, /healthz and any extra routes.
    pub async fn start(&self, extra: Option<Router>) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let mut app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        if let Some(extra) = extra {
            app = app.merge(extra);
        }

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.bound.lock() = Some(local_addr);

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

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered_under_namespace() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.records_dropped.inc_by(3.0);
        health
            .lines_classified
            .with_label_values(&["counter_sample"])
            .inc();

        let text = health.render().expect("render");
        assert!(text.contains("hpxdash_records_dropped_total 3"));
        assert!(text.contains("hpxdash_lines_classified_total{kind=\"counter_sample\"} 1"));
    }

    #[tokio::test]
    async fn test_server_serves_healthz_and_stops() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start(None).await.expect("start");
        let addr = health.local_addr().expect("bound");

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write");
        let mut body = String::new();
        stream.read_to_string(&mut body).await.expect("read");
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.ends_with("ok"));

        health.stop().await.expect("stop");
    }
}
