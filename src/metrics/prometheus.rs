//! Prometheus metrics definitions and HTTP server

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Gauge, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;

const SUBSYSTEM: &str = "volume_data_source_validator";
const LABEL_RESULT: &str = "result";

const MIN_ACCEPT_DELAY: Duration = Duration::from_millis(5);
const MAX_ACCEPT_DELAY: Duration = Duration::from_secs(1);

/// Default path metrics are served on
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Outcome classification of a single data source validation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataSourceResult {
    /// The PVC has no data source
    Empty,
    /// Cloning from another PVC
    Pvc,
    /// Restoring from a VolumeSnapshot
    Snapshot,
    /// Matched a registered VolumePopulator
    Populator,
    /// No VolumePopulator matches the data source
    Invalid,
    /// The catalog could not be listed or decoded
    Error,
}

impl DataSourceResult {
    pub const ALL: [DataSourceResult; 6] = [
        DataSourceResult::Empty,
        DataSourceResult::Pvc,
        DataSourceResult::Snapshot,
        DataSourceResult::Populator,
        DataSourceResult::Invalid,
        DataSourceResult::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceResult::Empty => "empty",
            DataSourceResult::Pvc => "pvc",
            DataSourceResult::Snapshot => "snapshot",
            DataSourceResult::Populator => "populator",
            DataSourceResult::Invalid => "invalid",
            DataSourceResult::Error => "error",
        }
    }
}

impl fmt::Display for DataSourceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for validation outcome counts
pub trait MetricsRecorder: Send + Sync {
    /// Record one validation with the given result
    fn increment_count(&self, result: DataSourceResult);
}

/// Validation metrics backed by a dedicated Prometheus registry
pub struct OperationMetrics {
    registry: Registry,
    op_results: IntCounterVec,
}

impl OperationMetrics {
    /// Create the metrics and register them, along with the process start
    /// time, into a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let start_time = Gauge::new(
            "process_start_time_seconds",
            "Start time of the process since unix epoch in seconds.",
        )
        .map_err(metrics_error)?;
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        start_time.set(since_epoch.as_secs_f64());
        registry
            .register(Box::new(start_time))
            .map_err(metrics_error)?;

        let op_results = IntCounterVec::new(
            Opts::new("operation_count", "Number of validations operations by result")
                .subsystem(SUBSYSTEM),
            &[LABEL_RESULT],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(op_results.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            op_results,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current count for one result label
    pub fn count(&self, result: DataSourceResult) -> u64 {
        self.op_results
            .with_label_values(&[result.as_str()])
            .get()
    }

    /// Render every registered metric in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl MetricsRecorder for OperationMetrics {
    fn increment_count(&self, result: DataSourceResult) {
        self.op_results
            .with_label_values(&[result.as_str()])
            .inc();
    }
}

fn metrics_error(e: prometheus::Error) -> crate::Error {
    crate::Error::config(format!("metrics: {}", e))
}

/// Serve metrics on an already bound listener until `cancel` fires.
///
/// `metrics_path` serves the registry; `/healthz` always answers `ok`.
pub async fn serve(
    listener: TcpListener,
    metrics_path: String,
    metrics: Arc<OperationMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    let metrics_path = Arc::new(metrics_path);
    info!(addr = ?listener.local_addr().ok(), path = %metrics_path, "Metrics server listening");

    let mut accept_delay = None;
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let stream = match accepted {
            Ok((stream, _)) => {
                accept_delay = None;
                stream
            }
            Err(e) => {
                // Transient (EMFILE, ECONNABORTED); keep serving.
                let delay = next_accept_delay(accept_delay);
                accept_delay = Some(delay);
                warn!(error = %e, ?delay, "Failed to accept metrics connection, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();
        let metrics_path = metrics_path.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = handle_request(&req, &metrics_path, &metrics);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection: {}", e);
            }
        });
    }

    info!("Metrics server stopped");
    Ok(())
}

/// Backoff after a failed accept: 5ms, doubling up to 1s.
fn next_accept_delay(previous: Option<Duration>) -> Duration {
    match previous {
        None => MIN_ACCEPT_DELAY,
        Some(delay) => (delay * 2).min(MAX_ACCEPT_DELAY),
    }
}

/// Route one HTTP request
fn handle_request<B>(
    req: &Request<B>,
    metrics_path: &str,
    metrics: &OperationMetrics,
) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    if path == metrics_path {
        metrics_response(metrics)
    } else if path == "/healthz" {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::NOT_FOUND, "Not Found")
    }
}

/// Generate metrics response
fn metrics_response(metrics: &OperationMetrics) -> Response<Full<Bytes>> {
    match metrics.encode() {
        Ok((content_type, buffer)) => {
            let mut response = Response::new(Full::new(Bytes::from(buffer)));
            if let Ok(value) = content_type.parse() {
                response
                    .headers_mut()
                    .insert(hyper::header::CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
