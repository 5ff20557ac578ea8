use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use aigw_common::LogMode;
use aigw_core::{Dispatcher, PromptLog};
use aigw_provider_impl::AdapterRegistry;
use aigw_provider_core::ProviderPoolManager;
use aigw_risk::{LifecycleStore, RiskManager};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let config = args
        .into_patch()
        .into_config()
        .context("unparseable configuration")?;

    match config.log_mode {
        LogMode::None => {}
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .init();
        }
    }
    let config = Arc::new(config);

    let store = LifecycleStore::new(config.lifecycle_file.clone());
    store.load_from_disk().await;
    let risk = Arc::new(RiskManager::new(
        store.clone(),
        config.risk_mode,
        Duration::from_millis(config.identity_window_ms),
    ));

    let pool = Arc::new(ProviderPoolManager::new(
        config.pools_file.clone(),
        risk.clone(),
    ));
    pool.load_from_disk().await;
    store.initialize_from_pools(&pool.seeds().await).await;

    // The default provider must have at least one configured credential.
    if !pool
        .provider_types()
        .await
        .iter()
        .any(|provider| provider == &config.default_provider)
    {
        anyhow::bail!(
            "no credentials configured for default provider {}",
            config.default_provider
        );
    }

    let registry = Arc::new(AdapterRegistry::new(config.clone()));
    let prompt_log = Arc::new(PromptLog::new(
        config.log_mode,
        config.prompt_input_log.clone(),
        config.prompt_output_log.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        risk,
        pool,
        registry,
        prompt_log,
    ));

    let app = aigw_router::gateway_router(config.clone(), dispatcher);
    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("cannot bind {bind}"))?;
    info!(event = "serve", bind = %bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Make sure the last lifecycle mutations reach disk before exit.
    store.flush_now().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(event = "shutdown");
}
