mod config;
mod logging;
mod server;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use switchboard_sfu::{RoomRegistry, WebRtcFactory};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(about = "WebRTC selective forwarding unit", long_about = None)]
struct Args {
    /// Path to a YAML config file
    #[arg(short, long, env = "SWITCHBOARD_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = config::load_config(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Switchboard SFU starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Build the media engine and room registry
    let factory = WebRtcFactory::new(&config.sfu)?;
    let registry = RoomRegistry::new(config.sfu.clone(), Arc::new(factory));

    // 4. Serve signaling until shutdown
    server::serve(&config, registry).await?;

    info!("Switchboard SFU stopped");
    Ok(())
}
