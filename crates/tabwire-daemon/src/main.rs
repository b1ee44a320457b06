//! tabwired: serve RPC calls into browser tabs.
//!
//! Run:
//!   cargo run -p tabwire-daemon -- --listen 127.0.0.1:8765
//!   cargo run -p tabwire-daemon -- --config tabwire.toml --relay-url wss://control.example/relay
//!
//! Then, with a tab connected to ws://127.0.0.1:8765/?name=main:
//!   curl localhost:8766/api/status
//!   curl -X POST localhost:8766/api/call/user:info -d '{}' -H 'content-type: application/json'

use clap::Parser;
use tabwire_daemon::{Args, Config};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "tabwire=debug" } else { "tabwire=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    let config = Config::resolve(&args)?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutting down");
                    shutdown.cancel();
                }
                Err(e) => tracing::warn!("Ctrl-C handler unavailable: {}", e),
            }
        }
    });

    tabwire_daemon::run(config, shutdown).await
}
