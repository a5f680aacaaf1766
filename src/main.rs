//! Volume Data Source Validator
//!
//! Main entry point. Parses configuration, sets up the Kubernetes client and
//! the optional metrics server, and runs the controller until shutdown.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use volume_data_source_validator::{
    config::Args,
    controllers::{self, Context},
    metrics::{self, OperationMetrics},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    init_tracing();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Volume Data Source Validator");

    let config = args.into_config()?;

    // Create Kubernetes client
    let client = config.client().await?;
    info!("Connected to Kubernetes API server");

    let metrics = Arc::new(OperationMetrics::new()?);
    let cancel = CancellationToken::new();

    // Bind before starting the controller so a bad endpoint fails startup
    let metrics_handle = match config.http_endpoint {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                error!("failed to listen on address[{}], error[{}]", addr, e);
                e
            })?;
            info!("Metrics http server successfully started on {}, {}", addr, config.metrics_path);
            Some(tokio::spawn(metrics::serve(
                listener,
                config.metrics_path.clone(),
                metrics.clone(),
                cancel.clone(),
            )))
        }
        None => None,
    };

    let context = Arc::new(Context::new(client, config, metrics));
    let controller = controllers::run(context, cancel.clone());
    tokio::pin!(controller);

    // Handle graceful shutdown
    let result = tokio::select! {
        result = &mut controller => result,
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping controller");
            cancel.cancel();
            controller.await
        }
    };
    cancel.cancel();

    if let Some(handle) = metrics_handle {
        match handle.await {
            Ok(Ok(())) => info!("Metrics server successfully shutdown"),
            Ok(Err(e)) => error!("Metrics server failed: {}", e),
            Err(e) => error!("Metrics server task failed: {}", e),
        }
    }

    result?;
    info!("Volume Data Source Validator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
