use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Troupe Server - serve stateful actors over HTTP, WebSocket and SSE
#[derive(Debug, Parser)]
#[command(name = "troupe-server")]
#[command(author, version, about)]
pub struct ServerArgs {
    /// Runtime configuration file (TOML). Defaults apply when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind, overriding the `[server]` section
    #[arg(short, long)]
    pub address: Option<SocketAddr>,

    /// Logging level (e.g. 'info', 'debug'), overriding the `[logging]` section
    #[arg(short, long)]
    pub log_level: Option<String>,
}
