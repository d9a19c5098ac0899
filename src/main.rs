//! Process entry point: parses the CLI, loads configuration, wires the
//! bridge together, and runs until `SIGINT`/`SIGTERM` (§4.7, §6).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use edge_bridge::Bridge;
use edge_config::BridgeConfig;
use edge_credentials::EnvCredentialStore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "edge-connector", version, about = "OT/IoT edge ingest connector")]
struct Cli {
    /// Path to the bridge configuration YAML file.
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let credential_store = Arc::new(EnvCredentialStore::new());

    let config = match BridgeConfig::load(&cli.config, credential_store.as_ref()).await {
        Ok(config) => config,
        Err(err) => {
            error!(reason = %err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let bridge = match Bridge::new(config, credential_store) {
        Ok(bridge) => bridge,
        Err(err) => {
            error!(reason = %err, "failed to construct bridge");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = bridge.start().await {
        error!(reason = %err, "failed to start bridge");
        return ExitCode::FAILURE;
    }
    info!("edge-connector running, press Ctrl-C to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(reason = %err, "failed to listen for shutdown signal");
    }

    info!("shutdown signal received");
    bridge.stop().await;
    ExitCode::SUCCESS
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
