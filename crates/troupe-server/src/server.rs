use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use troupe::SharedTopology;

use crate::router::router;

pub struct TroupeServer {
    address: SocketAddr,
    topology: SharedTopology,
}

impl TroupeServer {
    pub fn new(address: SocketAddr, topology: SharedTopology) -> Self {
        Self { address, topology }
    }

    /// Serve until ctrl-c, then shut the topology down.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.address)
            .await
            .with_context(|| format!("Failed to bind {}", self.address))?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let address = listener.local_addr()?;
        info!("Troupe server listening on {}", address);

        axum::serve(listener, router(self.topology.clone()))
            .with_graceful_shutdown(shutdown)
            .await
            .context("Server error")?;

        info!("Server stopped, shutting down actors");
        self.topology.shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
