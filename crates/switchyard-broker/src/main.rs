use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use switchyard_broker::{master, node, SwitchyardConfig};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "switchyard", author, version, about)]
struct Cli {
    /// Configuration file. Defaults to the user config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the master: node listener, router, liveness and broadcast relay.
    Master,
    /// Node operations.
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },
}

#[derive(Subcommand, Debug)]
enum NodeAction {
    /// Request a certificate from the master and wait for approval.
    Register,
    /// Run the node heartbeat agent with installed certificates.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SwitchyardConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, shutting down");
                on_signal.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for interrupts"),
        }
    });

    match cli.command {
        Command::Master => master::run(&config, cancel).await,
        Command::Node { action: NodeAction::Register } => {
            let installed = node::register(&config).await?;
            println!(
                "registered {}; certificate installed at {}",
                config.node.name,
                installed.node_cert.display()
            );
            Ok(())
        }
        Command::Node { action: NodeAction::Run } => node::run(&config, cancel).await,
    }
}
