//! Origination API: entry point.
//!
//! Serves the contract and application-progress endpoints plus the KYC
//! webhook over Axum, backed by SQLite.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use origination::api::{self, ApiState};
use origination::config::{Config, VendorConfig};
use origination::db;
use origination::vendors::Vendors;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    if config.kyc_webhook_secret.is_none() {
        tracing::warn!("KYC_WEBHOOK_SECRET not set; webhook requests are not authenticated");
    }

    // Surface vendor misconfiguration at boot.
    let vendor_config = VendorConfig::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    match Vendors::from_config(&vendor_config) {
        Ok(_) => info!("Vendor adapters configured"),
        Err(e) => tracing::warn!("Vendor adapters unavailable: {e}"),
    }

    let api_state = Arc::new(ApiState {
        pool: pool.clone(),
        kyc_webhook_secret: config.kyc_webhook_secret.clone(),
    });

    let app = api::build_router(api_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    pool.close().await;
    info!("Shut down cleanly");
    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn watch_signals(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    token.cancel();
}
