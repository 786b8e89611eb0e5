//! WebSocket transports: actor connections speaking the JSON client
//! protocol, and raw sockets handed straight to the actor.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Uri};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use troupe::actor::protocol::parse_binary_message;
use troupe::actor::{
    parse_message, ConnFrame, PushConnDriver, RawFrame, RawInbound, RawOutbound, RawSocketTransport,
};
use troupe::{ActorId, RequestInfo, SharedTopology};

use crate::error::ApiResult;
use crate::router::{header_map, open_conn, request_info, AppState, ConnOpen, ConnectQuery};

pub async fn connect_websocket(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let open = query.into_open()?;
    let request = request_info(&uri, &headers);
    let actor_id = ActorId::new(actor_id);
    Ok(ws.on_upgrade(move |socket| serve_conn(state.topology, actor_id, open, request, socket)))
}

async fn serve_conn(
    topology: SharedTopology,
    actor_id: ActorId,
    open: ConnOpen,
    request: RequestInfo,
    socket: WebSocket,
) {
    let (driver, mut frames) = PushConnDriver::websocket();
    let driver = Arc::new(driver);
    let (mut sender, mut receiver) = socket.split();
    let closed_by_server = Arc::new(AtomicBool::new(false));

    // Running before the connect so a failing `on_connect` can close us
    let closed = closed_by_server.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match frame {
                ConnFrame::Message(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                ConnFrame::Close { reason, ack } => {
                    closed.store(true, Ordering::SeqCst);
                    let close = CloseFrame {
                        code: close_code::NORMAL,
                        reason: reason.unwrap_or_default().into(),
                    };
                    let _ = sender.send(Message::Close(Some(close))).await;
                    let _ = ack.send(());
                    break;
                }
            }
        }
    });

    let connected = match open_conn(&topology, &actor_id, open, request, driver.clone()).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!("WebSocket connect to actor {} refused: {}", actor_id, e);
            driver.send_error(&e);
            driver.close(Some(e.code().to_string())).await;
            let _ = send_task.await;
            return;
        }
    };
    info!("Conn {} opened on actor {}", connected.conn_id, actor_id);

    let max_size = topology.context().config.actor.max_incoming_message_size;
    while let Some(message) = receiver.next().await {
        let parsed = match message {
            Ok(Message::Text(text)) => parse_message(text.as_str(), max_size),
            Ok(Message::Binary(data)) => parse_binary_message(&data, max_size),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error on conn {}: {}", connected.conn_id, e);
                break;
            }
        };
        let result = match parsed {
            Ok(message) => {
                topology
                    .send_message(&actor_id, &connected.conn_id, &connected.conn_token, message)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            driver.send_error(&e);
        }
    }

    // A server side close means the conn is already gone or was handed to
    // a newer transport by a reconnect
    if !closed_by_server.load(Ordering::SeqCst) {
        if let Err(e) = topology.disconnect(&actor_id, &connected.conn_id).await {
            debug!("Failed to remove conn {}: {}", connected.conn_id, e);
        }
    }
    send_task.abort();
    info!("Conn {} closed on actor {}", connected.conn_id, actor_id);
}

pub async fn raw_websocket(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let transport = state
        .topology
        .open_raw_websocket(&ActorId::new(actor_id), uri.to_string(), header_map(&headers))
        .await?;
    Ok(ws.on_upgrade(move |socket| bridge_raw(socket, transport)))
}

async fn bridge_raw(socket: WebSocket, transport: RawSocketTransport) {
    let RawSocketTransport {
        id,
        inbound,
        mut outbound,
    } = transport;
    let (mut sender, mut receiver) = socket.split();
    debug!("Raw socket {} open", id);

    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let message = match event {
                RawOutbound::Frame(RawFrame::Text(text)) => Message::Text(text.into()),
                RawOutbound::Frame(RawFrame::Binary(data)) => Message::Binary(data.into()),
                RawOutbound::Close { code, reason } => {
                    let close = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = sender.send(Message::Close(Some(close))).await;
                    break;
                }
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let (code, reason) = loop {
        let frame = match receiver.next().await {
            Some(Ok(Message::Text(text))) => RawFrame::Text(text.to_string()),
            Some(Ok(Message::Binary(data))) => RawFrame::Binary(data.to_vec()),
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|frame| (frame.code, frame.reason.to_string()))
                    .unwrap_or((close_code::NORMAL, String::new()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("Raw socket {} errored: {}", id, e);
                break (close_code::ABNORMAL, String::new());
            }
            None => break (close_code::ABNORMAL, String::new()),
        };
        if inbound.send(RawInbound::Frame(frame)).is_err() {
            debug!("Actor dropped raw socket {}", id);
        }
    };

    let _ = inbound.send(RawInbound::Close { code, reason });
    send_task.abort();
    debug!("Raw socket {} closed with {}", id, code);
}
