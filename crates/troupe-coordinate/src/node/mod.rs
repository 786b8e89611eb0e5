//! # Node
//!
//! The message loop of one node. It drains the node's channel on the
//! coordinate driver and dispatches every message to its handler.
//!
//! Handlers that only touch local tables run inline so frames keep their
//! order. Anything that awaits the actor runs on its own task, acknowledged
//! once the outcome is known.

mod handlers;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::global_state::GlobalState;
use crate::protocol::NodeMessage;

pub(crate) use handlers::handle_message;

/// Spawn the loop that consumes `rx` until the channel closes or the node
/// shuts down.
pub fn spawn_message_loop(
    global: Arc<GlobalState>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Node {} listening", global.node_id);
        loop {
            let payload = tokio::select! {
                _ = global.shutdown.cancelled() => break,
                payload = rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };

            match NodeMessage::decode(&payload) {
                Ok(message) => handle_message(&global, message).await,
                Err(e) => warn!("Node {} dropped an undecodable message: {}", global.node_id, e),
            }
        }
        info!("Node {} stopped listening", global.node_id);
    })
}
