//! Process configuration
//!
//! Parsed once from the command line (with environment fallbacks) and
//! immutable for the lifetime of the process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;

use crate::error::{Error, Result};
use crate::metrics::DEFAULT_METRICS_PATH;

/// Volume Data Source Validator - warns about PVC data sources no populator can handle
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Absolute path to the kubeconfig file. Required only when running out of cluster.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Resync interval of the controller (examples: `60s`, `1m`, `1h30m`; a bare
    /// number is seconds). 0 disables resync.
    #[arg(long, env = "RESYNC_PERIOD", default_value = "1m", value_parser = parse_duration)]
    pub resync_period: Duration,

    /// Number of worker threads.
    #[arg(long, env = "WORKER_THREADS", default_value_t = 10)]
    pub worker_threads: usize,

    /// TCP address of the HTTP server for metrics (example: `:8080`). Empty disables the server.
    #[arg(long, env = "HTTP_ENDPOINT", default_value = "")]
    pub http_endpoint: String,

    /// HTTP path where prometheus metrics will be exposed.
    #[arg(long, env = "METRICS_PATH", default_value = DEFAULT_METRICS_PATH)]
    pub metrics_path: String,
}

/// Validated configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub kubeconfig: Option<PathBuf>,
    pub resync_period: Duration,
    pub worker_threads: usize,
    /// Metrics listen address; `None` disables the metrics server
    pub http_endpoint: Option<SocketAddr>,
    pub metrics_path: String,
}

impl Args {
    /// Validate the raw arguments
    pub fn into_config(self) -> Result<Config> {
        if self.worker_threads == 0 {
            return Err(Error::config("worker-threads must be at least 1"));
        }
        if !self.metrics_path.starts_with('/') {
            return Err(Error::config(format!(
                "metrics-path '{}' must start with '/'",
                self.metrics_path
            )));
        }

        Ok(Config {
            kubeconfig: self.kubeconfig,
            resync_period: self.resync_period,
            worker_threads: self.worker_threads,
            http_endpoint: parse_endpoint(&self.http_endpoint)?,
            metrics_path: self.metrics_path,
        })
    }
}

/// Parse a duration such as `90s`, `1m30s`, `500ms` or `2h`.
///
/// A bare unsigned integer is taken as seconds.
fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration '{}'", value));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("invalid duration '{}': {}", value, e))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Some(Duration::from_millis(amount)),
            "s" => Some(Duration::from_secs(amount)),
            "m" => Duration::from_secs(amount).checked_mul(60),
            "h" => Duration::from_secs(amount).checked_mul(3600),
            other => return Err(format!("unknown unit '{}' in duration '{}'", other, value)),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| format!("duration '{}' out of range", value))?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Parse `host:port` or `:port`; empty means disabled.
fn parse_endpoint(endpoint: &str) -> Result<Option<SocketAddr>> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Ok(None);
    }
    let full = if endpoint.starts_with(':') {
        format!("0.0.0.0{}", endpoint)
    } else {
        endpoint.to_string()
    };
    full.parse()
        .map(Some)
        .map_err(|e| Error::config(format!("invalid http-endpoint '{}': {}", endpoint, e)))
}

impl Config {
    /// Build a Kubernetes client from the kubeconfig file if one was given,
    /// otherwise from the in-cluster or default environment.
    pub async fn client(&self) -> Result<Client> {
        let Some(path) = &self.kubeconfig else {
            return Ok(Client::try_default().await?);
        };

        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            Error::config(format!("failed to read kubeconfig {:?}: {}", path, e))
        })?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::config(format!("invalid kubeconfig {:?}: {}", path, e)))?;
        Ok(Client::try_from(config)?)
    }
}
