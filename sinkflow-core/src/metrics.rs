use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Error;

// counters, the `_total` suffix is added by the encoder
const RECORDS_READ: &str = "records_read";
const RECORDS_WRITTEN: &str = "records_written";
const RECORDS_DROPPED: &str = "records_dropped";
const WRITE_ERRORS: &str = "write_errors";
const COMMITS: &str = "commits";
const COMMIT_ERRORS: &str = "commit_errors";
// gauges
const ASSIGNED_PARTITIONS: &str = "assigned_partitions";

const REASON_LABEL: &str = "reason";
const CLASS_LABEL: &str = "class";

/// The global register of all metrics.
#[derive(Default)]
struct GlobalRegistry {
    // It is okay to use a sync mutex because we register each metric only one time.
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix("sinkflow")),
        }
    }
}

/// GLOBAL_REGISTRY is the static global registry which is initialized only once.
static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

/// global_registry is a helper function to get the GLOBAL_REGISTRY
fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Metrics of the poll-process-commit loop.
pub(crate) struct ForwarderMetrics {
    read_total: Counter,
    written_total: Counter,
    dropped_total: Family<Vec<(String, String)>, Counter>,
    write_errors_total: Family<Vec<(String, String)>, Counter>,
    commits_total: Counter,
    commit_errors_total: Counter,
    assigned_partitions: Gauge,
}

impl ForwarderMetrics {
    fn new() -> Self {
        let metrics = Self {
            read_total: Counter::default(),
            written_total: Counter::default(),
            dropped_total: Family::<Vec<(String, String)>, Counter>::default(),
            write_errors_total: Family::<Vec<(String, String)>, Counter>::default(),
            commits_total: Counter::default(),
            commit_errors_total: Counter::default(),
            assigned_partitions: Gauge::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            RECORDS_READ,
            "Total number of records read from the log",
            metrics.read_total.clone(),
        );
        registry.register(
            RECORDS_WRITTEN,
            "Total number of records written to the store",
            metrics.written_total.clone(),
        );
        registry.register(
            RECORDS_DROPPED,
            "Total number of records dropped without being written, labeled by reason",
            metrics.dropped_total.clone(),
        );
        registry.register(
            WRITE_ERRORS,
            "Total number of failed store writes, labeled by error class",
            metrics.write_errors_total.clone(),
        );
        registry.register(
            COMMITS,
            "Total number of successful offset commits",
            metrics.commits_total.clone(),
        );
        registry.register(
            COMMIT_ERRORS,
            "Total number of failed offset commits",
            metrics.commit_errors_total.clone(),
        );
        registry.register(
            ASSIGNED_PARTITIONS,
            "Number of partitions currently assigned to this consumer",
            metrics.assigned_partitions.clone(),
        );
        metrics
    }

    pub(crate) fn read(&self, count: usize) {
        self.read_total.inc_by(count as u64);
    }

    pub(crate) fn written(&self) {
        self.written_total.inc();
    }

    pub(crate) fn dropped(&self, reason: &str, count: usize) {
        self.dropped_total
            .get_or_create(&vec![(REASON_LABEL.to_string(), reason.to_string())])
            .inc_by(count as u64);
    }

    pub(crate) fn write_error(&self, class: &str) {
        self.write_errors_total
            .get_or_create(&vec![(CLASS_LABEL.to_string(), class.to_string())])
            .inc();
    }

    pub(crate) fn committed(&self) {
        self.commits_total.inc();
    }

    pub(crate) fn commit_error(&self) {
        self.commit_errors_total.inc();
    }

    pub(crate) fn set_assigned(&self, count: usize) {
        self.assigned_partitions.set(count as i64);
    }
}

static FORWARDER_METRICS: OnceLock<ForwarderMetrics> = OnceLock::new();

pub(crate) fn forwarder_metrics() -> &'static ForwarderMetrics {
    FORWARDER_METRICS.get_or_init(ForwarderMetrics::new)
}

// metrics_handler is used to generate and return a snapshot of the
// current state of the metrics in the global registry
async fn metrics_handler() -> impl IntoResponse {
    // make sure the forwarder metrics are registered even before the first cycle
    forwarder_metrics();
    let state = global_registry().registry.lock();
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &state) {
        error!(?e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    debug!("Exposing metrics: {:?}", buffer);
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// router for metrics and k8s health endpoints
fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
}

/// Serves the metrics and health endpoints until the token is cancelled.
pub(crate) async fn start_metrics_http_server(
    addr: SocketAddr,
    cln_token: CancellationToken,
) -> crate::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(?addr, "Metrics server listening");

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(cln_token.cancelled_owned())
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {e}")))
}

/// Runs the metrics server in the background. A failure is logged as soon as the server stops,
/// the forwarder keeps running without it.
pub(crate) fn spawn_metrics_http_server(
    addr: SocketAddr,
    cln_token: CancellationToken,
) -> JoinHandle<crate::Result<()>> {
    tokio::spawn(async move {
        start_metrics_http_server(addr, cln_token)
            .await
            .inspect_err(|e| error!(?e, %addr, "Metrics server failed"))
    })
}
