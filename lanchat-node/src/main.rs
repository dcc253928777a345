// LanChat node: discovery, transport and terminal chat.

mod cli;
mod config;
mod discovery;
mod node;
mod transport;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::node::Node;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref()).context("loading config")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let node = Node::start(cfg.clone()).await?;
        let addr = node.local_addr()?;
        println!("Addresses: {}", addr);
        println!("ID: {}", node.local_id());
        println!("ProtocolID: {}", cfg.protocol_id);
        println!("command to connect: lanchat-node --peer-address {}", addr);
        node.run(cli.peer_address, shutdown_signal()).await
    });
    // Stdin is read on a blocking thread that only returns on the next line;
    // don't wait for it.
    rt.shutdown_timeout(Duration::from_millis(200));
    if let Err(e) = &result {
        tracing::error!(error = %e, "node failed");
    }
    result
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.context("installing Ctrl+C handler")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("installing Ctrl+C handler")?;
    }
    tracing::info!("shutdown signal received");
    Ok(())
}
