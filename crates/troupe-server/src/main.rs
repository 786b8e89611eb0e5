use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use troupe::{logging, RuntimeConfig, RuntimeContext, SharedTopology, StandaloneTopology, SystemClock};
use troupe_server::TroupeServer;

mod args;
mod demo;

use args::ServerArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();

    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    logging::setup_global_logging(&config.logging)?;

    let address = match args.address {
        Some(address) => address,
        None => format!("{}:{}", config.server.host, config.server.port)
            .parse::<SocketAddr>()
            .context("Invalid [server] host or port")?,
    };
    info!("Starting troupe server on {}", address);

    let runtime = RuntimeContext::memory(config, demo::registry(), Arc::new(SystemClock));
    let topology: SharedTopology = StandaloneTopology::new(runtime.context);
    TroupeServer::new(address, topology).run().await
}
