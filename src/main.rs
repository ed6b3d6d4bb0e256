//! Escrow Relayer - cross-chain HTLC escrow swap coordination
//!
//! This binary watches the source chain escrow factory, mirrors every new
//! escrow on the destination chain and settles the source side once the
//! secret is revealed.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use escrow_relayer::api::{self, AppState};
use escrow_relayer::chain::{
    ChainProvider, ChainWatcher, CosmWasmDestination, EvmSourceGateway, SignerGateway,
};
use escrow_relayer::clock::{Clock, SystemClock};
use escrow_relayer::config::Settings;
use escrow_relayer::coordination::{
    EscrowRelayer, EscrowResolver, Passthrough, RecipientMapper, StaticRecipients,
};
use escrow_relayer::metrics::{self, MetricsServer};
use escrow_relayer::notify::{NoopSink, NotificationSink, WebhookSink};
use escrow_relayer::state::SwapLedger;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Escrow Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: {} ({}) -> {} ({})",
        settings.source.name,
        settings.source.chain_id,
        settings.destination.name,
        settings.destination.chain_id
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = Arc::new(SwapLedger::new(
        settings.resolver.hash_algorithm,
        clock.clone(),
    ));

    // Source chain watcher
    let provider = Arc::new(ChainProvider::new(settings.source.clone())?);
    let watcher = ChainWatcher::new(
        provider,
        settings.relayer.max_history_window,
        settings.relayer.request_timeout(),
        settings.relayer.start_block,
    );

    let sink: Arc<dyn NotificationSink> = match WebhookSink::from_config(&settings.notifications)? {
        Some(webhook) => Arc::new(webhook),
        None => Arc::new(NoopSink),
    };

    let relayer = Arc::new(EscrowRelayer::new(
        watcher,
        ledger,
        sink,
        clock.clone(),
        settings.relayer.clone(),
        settings.ledger.clone(),
    ));
    info!("Escrow relayer initialized");

    // Outbound chain clients
    let gateway_timeout = settings.resolver.request_timeout();
    let destination = Arc::new(CosmWasmDestination::new(
        SignerGateway::new(
            &settings.destination.gateway_url,
            settings.destination.chain_id,
            gateway_timeout,
        )?,
        settings.destination.cw20_contract.clone(),
        settings.destination.escrow_contract.clone(),
    ));
    let source = Arc::new(EvmSourceGateway::new(
        SignerGateway::new(
            &settings.source.gateway_url,
            settings.source.chain_id,
            gateway_timeout,
        )?,
        settings.source.resolver_contract.clone(),
    ));

    let recipients: Arc<dyn RecipientMapper> = if settings.recipients.is_empty() {
        Arc::new(Passthrough)
    } else {
        Arc::new(StaticRecipients::new(settings.recipients.clone()))
    };

    let resolver = Arc::new(
        EscrowResolver::new(
            relayer.clone(),
            destination,
            source,
            clock,
            settings.resolver.clone(),
            settings.destination.expiry_height,
        )
        .with_recipients(recipients),
    );
    info!("Escrow resolver initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState::new(relayer.clone(), resolver.clone());
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start relayer
    let relayer_handle = tokio::spawn({
        let relayer = relayer.clone();
        async move {
            if let Err(e) = relayer.run().await {
                error!("Escrow relayer error: {}", e);
            }
        }
    });

    // Start resolver
    let resolver_handle = tokio::spawn({
        let resolver = resolver.clone();
        async move {
            if let Err(e) = resolver.run().await {
                error!("Escrow resolver error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let relayer = relayer.clone();
        let interval = settings.ledger.sweep_interval().max(Duration::from_secs(30));
        async move {
            loop {
                tokio::time::sleep(interval).await;

                if relayer.health_check().await {
                    metrics::record_health_check();
                } else {
                    warn!("Source chain health check failed");
                    metrics::record_health_check_failure();
                }

                let stuck = relayer.stuck();
                if !stuck.is_empty() {
                    warn!("{} swaps need attention (see /swaps/stuck)", stuck.len());
                }
            }
        }
    });

    info!("Escrow Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    resolver.stop().await;
    relayer.stop().await;

    // Abort background tasks
    api_handle.abort();
    relayer_handle.abort();
    resolver_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Escrow Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,escrow_relayer=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
