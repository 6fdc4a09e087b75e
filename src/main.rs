use std::{process, sync::Arc};

use clap::Parser;
use walletd::{
    api::{self, AppState},
    config::{CliArgs, Config},
    fixtures, storage, telemetry, BalanceReader, EngineOptions, LedgerEngine,
};

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    telemetry::init_tracing(&config.logging);
    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "walletd exited with error");
        process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = telemetry::init_metrics()?;

    let store = storage::open_store(&config.storage)?;
    let cache = storage::open_cache(&config.cache)?;

    let created = fixtures::provision_accounts(store.as_ref(), &config.accounts)?;
    if created > 0 {
        tracing::info!(created, "Provisioned fixture accounts");
    }

    let reader = Arc::new(BalanceReader::new(store.clone(), cache.clone(), config.cache.ttl()));
    let engine = Arc::new(LedgerEngine::new(
        store.clone(),
        cache.clone(),
        reader,
        EngineOptions {
            invalidation_retries: config.cache.invalidation_retries,
        },
    ));

    let app = api::router(AppState {
        engine,
        store,
        cache,
        metrics,
    });

    let addr = config.listen_addr()?;
    tracing::info!(%addr, "walletd listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("walletd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
