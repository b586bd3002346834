//! OTA Agent
//!
//! Runs the OTA controller against the platform transport and serves the
//! local status API.

use anyhow::{Context, Result};
use ota_agent::{
    create_router, AgentConfig, AppState, CycleHistory, HttpFetcher, MockPlatform, OtaController,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ota_agent=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting OTA Agent");

    // Load configuration
    let config = AgentConfig::from_env()?;
    info!("Configuration loaded");
    info!("  Platform: {}:{}", config.iot_address, config.iot_port);
    info!("  Device: {}", config.device_id);
    info!("  Module: {} {}", config.module, config.module_version);
    info!("  Download directory: {}", config.download_dir.display());
    info!("  Transport: mock platform");

    config.ensure_directories()?;

    let transport = Arc::new(MockPlatform::from_config(&config));
    let fetcher = Arc::new(HttpFetcher::new());
    let history = CycleHistory::new(config.history_capacity);
    let api_addr = config.api_address();

    let (controller, handle) = OtaController::new(config, transport, fetcher, history.clone());

    let cancel = CancellationToken::new();
    let controller_cancel = cancel.clone();
    let mut controller_task = tokio::spawn(async move {
        info!("Starting OTA controller task");
        if let Err(e) = controller.run(controller_cancel).await {
            error!("OTA controller error: {}", e);
        }
    });

    let app = create_router(AppState { handle, history });
    let listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .context("Failed to bind status API address")?;
    info!("Status API listening on http://{}", api_addr);

    let mut api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Status API error: {:#}", e);
        }
    });

    tokio::select! {
        _ = &mut api_task => {
            error!("Status API task terminated unexpectedly");
        }
        _ = &mut controller_task => {
            error!("OTA controller task terminated unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    cancel.cancel();
    api_task.abort();
    let _ = controller_task.await;

    info!("OTA Agent stopped");
    Ok(())
}
