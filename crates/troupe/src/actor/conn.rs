//! # Connections
//!
//! A [`Conn`] is one client session attached to an actor instance. Its
//! identity (id, token, params, auth) is protocol agnostic; delivery goes
//! through a transport specific [`ConnDriver`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::actor::protocol::ToClient;
use crate::errors::ActorError;
use crate::id::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnDriverKind {
    WebSocket,
    Sse,
    Http,
}

/// Transport half of a connection.
#[async_trait]
pub trait ConnDriver: Send + Sync + 'static {
    fn kind(&self) -> ConnDriverKind;

    /// Push a message to the client. Never blocks on the network.
    fn send_message(&self, conn_id: &ConnId, message: &ToClient);

    /// Close the transport. Resolves once the transport has actually closed.
    async fn disconnect(&self, conn_id: &ConnId, reason: Option<String>);
}

/// Frames consumed by the task that owns a push transport.
#[derive(Debug)]
pub enum ConnFrame {
    /// Serialized [`ToClient`] message
    Message(String),
    /// Close the transport, then signal `ack`
    Close {
        reason: Option<String>,
        ack: oneshot::Sender<()>,
    },
}

/// Driver for transports that can push: WebSocket and SSE.
///
/// The transport task reads [`ConnFrame`]s from the receiver returned by the
/// constructor and acknowledges `Close` only after the socket or stream is
/// gone.
#[derive(Debug, Clone)]
pub struct PushConnDriver {
    kind: ConnDriverKind,
    tx: mpsc::UnboundedSender<ConnFrame>,
}

impl PushConnDriver {
    pub fn websocket() -> (Self, mpsc::UnboundedReceiver<ConnFrame>) {
        Self::with_kind(ConnDriverKind::WebSocket)
    }

    pub fn sse() -> (Self, mpsc::UnboundedReceiver<ConnFrame>) {
        Self::with_kind(ConnDriverKind::Sse)
    }

    fn with_kind(kind: ConnDriverKind) -> (Self, mpsc::UnboundedReceiver<ConnFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { kind, tx }, rx)
    }

    /// Close the transport. `false` if the transport task exited without
    /// acknowledging.
    pub async fn close(&self, reason: Option<String>) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .tx
            .send(ConnFrame::Close {
                reason,
                ack: ack_tx,
            })
            .is_err()
        {
            return false;
        }
        ack_rx.await.is_ok()
    }

    /// Push an error that no registered connection owns yet, such as a
    /// refused connect or an unparsable frame.
    pub fn send_error(&self, error: &ActorError) {
        match ToClient::error(error, None).to_json() {
            Ok(json) => {
                let _ = self.tx.send(ConnFrame::Message(json));
            }
            Err(e) => warn!("Failed to serialize error for client: {}", e),
        }
    }
}

#[async_trait]
impl ConnDriver for PushConnDriver {
    fn kind(&self) -> ConnDriverKind {
        self.kind
    }

    fn send_message(&self, conn_id: &ConnId, message: &ToClient) {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize message for conn {}: {}", conn_id, e);
                return;
            }
        };
        if self.tx.send(ConnFrame::Message(json)).is_err() {
            debug!("Dropping message for closed conn {}", conn_id);
        }
    }

    async fn disconnect(&self, conn_id: &ConnId, reason: Option<String>) {
        if !self.close(reason).await {
            debug!("Transport for conn {} was gone before the close", conn_id);
        }
    }
}

/// Request/response only. There is no channel to push on.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnDriver;

#[async_trait]
impl ConnDriver for HttpConnDriver {
    fn kind(&self) -> ConnDriverKind {
        ConnDriverKind::Http
    }

    fn send_message(&self, conn_id: &ConnId, _message: &ToClient) {
        warn!("Attempted to send a message to HTTP conn {}, which cannot receive messages", conn_id);
    }

    async fn disconnect(&self, _conn_id: &ConnId, _reason: Option<String>) {}
}

/// Serialized form of a connection inside the persisted actor record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedConn {
    pub id: ConnId,
    pub token: String,
    pub params: Value,
    pub state: Value,
    #[serde(default)]
    pub auth: Option<Value>,
    pub driver_kind: ConnDriverKind,
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

/// Output of the connect hooks, consumed by `create_conn`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedConn {
    pub params: Value,
    pub auth: Option<Value>,
    pub state: Value,
}

pub struct Conn {
    id: ConnId,
    token: String,
    params: Value,
    auth: Option<Value>,
    driver_kind: ConnDriverKind,
    state: Mutex<Value>,
    subscriptions: Mutex<HashSet<String>>,
    driver: Mutex<Option<Arc<dyn ConnDriver>>>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("driver_kind", &self.driver_kind)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Conn {
    pub fn new(id: ConnId, token: String, prepared: PreparedConn, driver: Arc<dyn ConnDriver>) -> Self {
        Self {
            id,
            token,
            params: prepared.params,
            auth: prepared.auth,
            driver_kind: driver.kind(),
            state: Mutex::new(prepared.state),
            subscriptions: Mutex::new(HashSet::new()),
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Rebuild a connection from the persisted record. It has no transport
    /// until a client reattaches.
    pub fn restore(persisted: PersistedConn) -> Self {
        Self {
            id: persisted.id,
            token: persisted.token,
            params: persisted.params,
            auth: persisted.auth,
            driver_kind: persisted.driver_kind,
            state: Mutex::new(persisted.state),
            subscriptions: Mutex::new(persisted.subscriptions.into_iter().collect()),
            driver: Mutex::new(None),
        }
    }

    pub fn to_persisted(&self) -> PersistedConn {
        let mut subscriptions: Vec<String> = lock(&self.subscriptions).iter().cloned().collect();
        subscriptions.sort();
        PersistedConn {
            id: self.id.clone(),
            token: self.token.clone(),
            params: self.params.clone(),
            state: lock(&self.state).clone(),
            auth: self.auth.clone(),
            driver_kind: self.driver_kind,
            subscriptions,
        }
    }

    pub fn id(&self) -> &ConnId {
        &self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn auth(&self) -> Option<&Value> {
        self.auth.as_ref()
    }

    pub fn driver_kind(&self) -> ConnDriverKind {
        self.driver_kind
    }

    pub fn state(&self) -> Value {
        lock(&self.state).clone()
    }

    pub fn set_state(&self, state: Value) {
        *lock(&self.state) = state;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.driver).is_some()
    }

    /// Check the token presented with a message against the one issued at
    /// connect time.
    pub fn verify_token(&self, token: &str) -> Result<(), ActorError> {
        let expected = self.token.as_bytes();
        let given = token.as_bytes();
        // Compare every byte so timing does not leak the matching prefix
        let mut diff = expected.len() ^ given.len();
        for (a, b) in expected.iter().zip(given.iter()) {
            diff |= (a ^ b) as usize;
        }
        if diff == 0 {
            Ok(())
        } else {
            Err(ActorError::IncorrectConnToken)
        }
    }

    pub fn subscriptions(&self) -> HashSet<String> {
        lock(&self.subscriptions).clone()
    }

    pub fn is_subscribed(&self, event_name: &str) -> bool {
        lock(&self.subscriptions).contains(event_name)
    }

    pub(crate) fn set_subscribed(&self, event_name: &str, subscribe: bool) {
        let mut subscriptions = lock(&self.subscriptions);
        if subscribe {
            subscriptions.insert(event_name.to_string());
        } else {
            subscriptions.remove(event_name);
        }
    }

    /// Send an event to this connection only.
    pub fn send(&self, event_name: impl Into<String>, args: Vec<Value>) {
        self.send_message(&ToClient::Event {
            name: event_name.into(),
            args,
        });
    }

    pub fn send_message(&self, message: &ToClient) {
        let driver = lock(&self.driver).clone();
        match driver {
            Some(driver) => driver.send_message(&self.id, message),
            None => debug!("Conn {} is detached, dropping message", self.id),
        }
    }

    /// Attach a new transport, replacing any previous one.
    pub(crate) fn attach_driver(&self, driver: Arc<dyn ConnDriver>) -> Option<Arc<dyn ConnDriver>> {
        lock(&self.driver).replace(driver)
    }

    /// Close the transport and wait for it to finish closing.
    pub async fn disconnect(&self, reason: Option<String>) {
        let driver = lock(&self.driver).take();
        if let Some(driver) = driver {
            driver.disconnect(&self.id, reason).await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prepared() -> PreparedConn {
        PreparedConn {
            params: json!({"name": "ada"}),
            auth: None,
            state: json!({"typing": false}),
        }
    }

    #[test]
    fn token_must_match_exactly() {
        let (driver, _rx) = PushConnDriver::websocket();
        let conn = Conn::new(ConnId::generate(), "abc123".to_string(), prepared(), Arc::new(driver));
        assert!(conn.verify_token("abc123").is_ok());
        assert_eq!(conn.verify_token("abc124"), Err(ActorError::IncorrectConnToken));
        assert_eq!(conn.verify_token("abc1234"), Err(ActorError::IncorrectConnToken));
        assert_eq!(conn.verify_token(""), Err(ActorError::IncorrectConnToken));
    }

    #[tokio::test]
    async fn push_driver_forwards_messages() {
        let (driver, mut rx) = PushConnDriver::sse();
        let conn = Conn::new(ConnId::generate(), "t".to_string(), prepared(), Arc::new(driver));
        conn.send("joined", vec![json!("ada")]);

        match rx.recv().await {
            Some(ConnFrame::Message(json)) => {
                let msg: ToClient = serde_json::from_str(&json).unwrap();
                assert_eq!(
                    msg,
                    ToClient::Event {
                        name: "joined".to_string(),
                        args: vec![json!("ada")],
                    }
                );
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn disconnect_waits_for_transport_close() {
        let (driver, mut rx) = PushConnDriver::websocket();
        let conn = Arc::new(Conn::new(ConnId::generate(), "t".to_string(), prepared(), Arc::new(driver)));

        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let transport_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let ConnFrame::Close { ack, .. } = frame {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    transport_closed.store(true, std::sync::atomic::Ordering::SeqCst);
                    let _ = ack.send(());
                    break;
                }
            }
        });

        conn.disconnect(Some("bye".to_string())).await;
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!conn.is_connected());
    }

    #[test]
    fn persisted_round_trip_is_detached() {
        let (driver, _rx) = PushConnDriver::websocket();
        let conn = Conn::new(ConnId::generate(), "t".to_string(), prepared(), Arc::new(driver));
        conn.set_subscribed("chat", true);

        let restored = Conn::restore(conn.to_persisted());
        assert_eq!(restored.id(), conn.id());
        assert!(restored.is_subscribed("chat"));
        assert!(!restored.is_connected());
        assert_eq!(restored.driver_kind(), ConnDriverKind::WebSocket);
    }
}
