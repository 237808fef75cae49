//! TradeWallet daemon
//!
//! Runs the rate refresh and broadcast loops against the upstream rates API
//! and keeps the wallet ledger available until Ctrl+C.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradewallet_fx::HttpRateProvider;
use tradewallet_ledger::{InMemoryWalletStore, PgWalletStore, WalletStore};
use tradewallet_service::{LogFormat, ServiceConfig, WalletService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!("Starting TradeWallet daemon");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let store: Arc<dyn WalletStore> = match &config.database_url {
        Some(url) => {
            let store = PgWalletStore::connect(url, config.database_max_connections).await?;
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, wallets are kept in memory");
            Arc::new(InMemoryWalletStore::new())
        }
    };

    let provider = Arc::new(HttpRateProvider::new(
        config.rates.api_url.clone(),
        config.rates.fetch_timeout,
    )?);

    let service = Arc::new(WalletService::new(config.clone(), store, provider));
    let mut feed = service.subscribe_rates();
    service.start().await?;

    info!(
        base = %config.rates.base_currency,
        rates_api = %config.rates.api_url,
        refresh_secs = config.rates.refresh_interval.as_secs(),
        "TradeWallet daemon running"
    );

    let pushes = tokio::spawn(async move {
        while let Some(snapshot) = feed.recv().await {
            info!(
                base = %snapshot.base,
                currencies = snapshot.len(),
                fetched_at = %snapshot.fetched_at,
                "Rate snapshot pushed"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    service.stop().await?;
    pushes.abort();

    info!("TradeWallet daemon shutdown complete");
    Ok(())
}
