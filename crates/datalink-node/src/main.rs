//! # Datalink Node
//!
//! Bridges the local estimation process, the flight computer serial link and
//! the wireless link to the peer node.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! datalink
//!
//! # Run with custom config
//! datalink --config /path/to/datalink.toml
//!
//! # Run with environment variables
//! DATALINK_SERIAL_DEVICE=/dev/ttyS4 DATALINK_WIRELESS_PEER=192.168.4.2:50000 datalink
//! ```

mod bridge;
mod config;
mod ipc;
mod launcher;
mod metrics;
mod node;
mod topics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Datalink bridge node
#[derive(Parser, Debug)]
#[command(name = "datalink")]
#[command(about = "Bridges the estimation process, the flight computer and the peer node")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "DATALINK_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "datalink=info,datalink_core=info,datalink_transport=info,datalink_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let args = Args::parse();
    let config = config::Config::load(args.config.as_deref())?;

    tracing::info!(
        "Starting datalink node {} (id {})",
        config.node.name,
        config.node.id
    );

    node::run(config).await
}
