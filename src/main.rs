use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;

use std::path::PathBuf;

use ganimed_node::{Node, NodeConfig, Wallet};

/// Runs a single ganimed node
#[derive(Debug, Parser)]
#[command(name = "ganimed-node", version, about)]
struct Args {
    /// JSON config file; without one a throwaway devnet is started
    #[arg(short, long, env = "GANIMED_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of the chain store, overrides `data_dir` from the config
    #[arg(short, long, env = "GANIMED_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

// Single-authority devnet with a funded dev wallet
fn devnet_config() -> NodeConfig {
    let wallet = Wallet::generate();
    info!("Created dev wallet with address: {}", wallet.address());

    // Export the secret key for testing
    info!(
        "Dev wallet secret key: {}",
        hex::encode(wallet.export_secret_key())
    );

    let mut config = NodeConfig::single_authority(wallet.address().clone());
    config
        .genesis
        .allocations
        .insert(wallet.address().clone(), 1_000_000_000);
    config
        .genesis
        .fee_allocations
        .insert(wallet.address().clone(), 1_000_000_000);
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(Env::new().default_filter_or("info"));

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            warn!("No config given, starting a throwaway devnet");
            devnet_config()
        }
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }

    let node = Node::new(config).context("building node")?;
    info!(
        "Node ready on {} at height {} using {} consensus",
        node.config().network_id,
        node.height(),
        node.consensus_kind()
    );

    let mut events = node.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!("Contract event {} on {}: {:?}", event.name(), event.contract(), event),
                Err(RecvError::Lagged(missed)) => warn!("Event log fell behind, skipped {} event(s)", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    node.start().context("starting consensus")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("Shutting down");
    node.stop();

    Ok(())
}
