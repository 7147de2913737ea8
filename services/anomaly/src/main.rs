use anomaly_service::analyzer::{Analyzer, AnalyzerDispatch, DisabledAnalyzer, HttpAnalyzer};
use anomaly_service::api::{start_api_server, AppState};
use anomaly_service::asset_store::S3AssetStore;
use anomaly_service::config::Config;
use anomaly_service::lifecycle::{RecordLifecycle, UploadSettings};
use anomaly_service::record_store::{MemoryRecordStore, PgRecordStore, RecordStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        kind = ?config.asset_store.kind,
        "Starting anomaly service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let record_store: Arc<dyn RecordStore> = match config.database {
        Some(ref database) => {
            let store = PgRecordStore::new(database)
                .await
                .context("Failed to initialize record store")?;

            if database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Arc::new(store)
        }
        None => {
            warn!("No database configured, records are kept in memory only");
            Arc::new(MemoryRecordStore::new())
        }
    };

    let asset_store = Arc::new(
        S3AssetStore::new(&config.asset_store)
            .await
            .context("Failed to initialize asset store")?,
    );

    // Config validation guarantees a base URL whenever dispatch is enabled.
    let analyzer: Arc<dyn Analyzer> = if config.analyzer.enabled {
        Arc::new(HttpAnalyzer::new(&config.analyzer).context("Failed to initialize analyzer")?)
    } else {
        warn!("Analyzer dispatch disabled, records will stay unknown");
        Arc::new(DisabledAnalyzer)
    };

    let dispatch = AnalyzerDispatch::new(analyzer);
    let lifecycle = RecordLifecycle::new(
        asset_store,
        record_store,
        dispatch.clone(),
        UploadSettings {
            kind: config.asset_store.kind,
            folder: config.asset_store.folder().to_string(),
            timeout: config.upload_timeout(),
        },
    );

    let api_state = AppState {
        lifecycle: Arc::new(lifecycle),
    };

    // Spawn API server task; it drains in-flight requests on SIGINT/SIGTERM
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, shutdown_signal()).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Anomaly service started successfully");

    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }

    info!("Shutting down anomaly service");

    dispatch.drain(config.drain_timeout()).await;

    info!("Anomaly service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
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
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
