//! The tabwire daemon: tab endpoint, control-plane relay and console in one process.

pub mod config;
pub mod console;

pub use config::{Args, Config, ConfigError};

use anyhow::Context;
use std::sync::Arc;
use tabwire_core::DeviceIdentity;
use tabwire_hub::{Hub, global, server};
use tabwire_relay::Relay;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Run every configured service until `shutdown` fires or one of them fails.
pub async fn run(config: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let hub = Hub::new(config.hub_config());
    if global::install(hub.clone()).is_err() {
        tracing::warn!("A process hub is already installed; keeping the existing one");
    }

    let mut tasks = JoinSet::new();

    let listener = TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("failed to bind tab endpoint on {}", config.server.listen))?;
    tracing::info!(
        "Accepting tabs on ws://{} ({} selector)",
        listener.local_addr()?,
        hub.selector_name()
    );
    tasks.spawn({
        let hub = hub.clone();
        let shutdown = shutdown.clone();
        async move {
            server::run(listener, hub, shutdown)
                .await
                .context("tab endpoint failed")
        }
    });

    let relay = config.relay_config().map(|relay_config| {
        let identity = DeviceIdentity::detect(config.relay.client_id.clone());
        Arc::new(Relay::new(relay_config, hub.clone(), identity))
    });
    match &relay {
        Some(relay) => {
            let relay = Arc::clone(relay);
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                // The tab endpoint outlives a relay that gave up.
                if let Err(e) = relay.run(shutdown).await {
                    tracing::error!("Relay stopped: {}", e);
                }
                Ok::<(), anyhow::Error>(())
            });
        }
        None => tracing::info!("No relay URL configured; relay disabled"),
    }

    if config.console.enabled {
        let listener = TcpListener::bind(config.console.listen)
            .await
            .with_context(|| format!("failed to bind console on {}", config.console.listen))?;
        let router = console::router(hub.clone(), relay.clone());
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            console::serve(listener, router, shutdown)
                .await
                .context("console failed")
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.context("service task panicked").and_then(|r| r);
        if let Err(e) = outcome {
            shutdown.cancel();
            return Err(e);
        }
    }

    tracing::info!("All services stopped");
    Ok(())
}
