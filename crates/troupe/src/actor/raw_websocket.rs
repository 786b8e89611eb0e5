//! Raw WebSockets handed directly to an actor's `on_raw_websocket` hook.
//!
//! The actor never sees the physical socket. It gets a [`RawWebSocket`] made
//! of two channels; whoever terminates the client socket (the router, or a
//! follower node relaying frames) holds the matching [`RawSocketTransport`].

use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::id::generate_message_id;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Events flowing from the client towards the actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawInbound {
    Frame(RawFrame),
    Close { code: u16, reason: String },
}

/// Events flowing from the actor towards the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawOutbound {
    Frame(RawFrame),
    Close { code: u16, reason: String },
}

/// Actor side of a raw socket.
#[derive(Debug)]
pub struct RawWebSocket {
    id: String,
    url: String,
    headers: HashMap<String, String>,
    outbound: mpsc::UnboundedSender<RawOutbound>,
    inbound: mpsc::UnboundedReceiver<RawInbound>,
}

/// Transport side of a raw socket.
#[derive(Debug)]
pub struct RawSocketTransport {
    pub id: String,
    pub inbound: mpsc::UnboundedSender<RawInbound>,
    pub outbound: mpsc::UnboundedReceiver<RawOutbound>,
}

/// Create a connected socket pair with a fresh id.
pub fn raw_websocket_pair(
    url: impl Into<String>,
    headers: HashMap<String, String>,
) -> (RawWebSocket, RawSocketTransport) {
    raw_websocket_pair_with_id(generate_message_id(), url, headers)
}

pub fn raw_websocket_pair_with_id(
    id: String,
    url: impl Into<String>,
    headers: HashMap<String, String>,
) -> (RawWebSocket, RawSocketTransport) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let socket = RawWebSocket {
        id: id.clone(),
        url: url.into(),
        headers,
        outbound: outbound_tx,
        inbound: inbound_rx,
    };
    let transport = RawSocketTransport {
        id,
        inbound: inbound_tx,
        outbound: outbound_rx,
    };
    (socket, transport)
}

impl RawWebSocket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Returns false once the client side is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outbound
            .send(RawOutbound::Frame(RawFrame::Text(text.into())))
            .is_ok()
    }

    pub fn send_binary(&self, data: Vec<u8>) -> bool {
        self.outbound.send(RawOutbound::Frame(RawFrame::Binary(data))).is_ok()
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.outbound.send(RawOutbound::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Next event from the client, `None` when the transport dropped.
    pub async fn recv(&mut self) -> Option<RawInbound> {
        self.inbound.recv().await
    }

    /// Split into an owned sender and receiver so a task can echo while
    /// another task pushes.
    pub fn split(self) -> (RawSocketSender, mpsc::UnboundedReceiver<RawInbound>) {
        (RawSocketSender { outbound: self.outbound }, self.inbound)
    }
}

#[derive(Debug, Clone)]
pub struct RawSocketSender {
    outbound: mpsc::UnboundedSender<RawOutbound>,
}

impl RawSocketSender {
    pub fn send(&self, frame: RawFrame) -> bool {
        self.outbound.send(RawOutbound::Frame(frame)).is_ok()
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.outbound.send(RawOutbound::Close {
            code,
            reason: reason.into(),
        });
    }
}
