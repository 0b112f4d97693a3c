//! resort-queue worker entry point

use resort_queue::{CancellationToken, QueueRuntime, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize QueueRuntime
/// 4. Listen until Ctrl-C, then dispose
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("RESORT_QUEUE__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "resort_queue=info,sqlx=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "resort_queue=info,sqlx=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting resort-queue worker...");

    // 2. Initialize metrics
    resort_queue::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        backend = config.queue.backend.as_str(),
        poll_interval_ms = config.queue.poll_interval_ms,
        "Configuration loaded"
    );

    // 4. Initialize runtime
    let runtime = QueueRuntime::new(config).await?;

    // 5. Listen until shutdown
    let cancel = CancellationToken::new();
    spawn_shutdown_signal(cancel.clone());
    runtime.run(cancel).await?;

    match resort_queue::metrics::render_metrics() {
        Ok(metrics) => tracing::debug!(%metrics, "Final metrics"),
        Err(error) => tracing::warn!(%error, "Failed to render metrics"),
    }
    tracing::info!("resort-queue worker stopped");

    Ok(())
}

/// Cancel `cancel` on Ctrl-C
fn spawn_shutdown_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received; draining");
                cancel.cancel();
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        }
    });
}
