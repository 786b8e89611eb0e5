//! Server-sent events transport. The stream only carries server to client
//! traffic; clients post their messages to the connection's message route.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info};

use troupe::actor::{ConnFrame, PushConnDriver};
use troupe::{ActorId, ConnId, SharedTopology};

use crate::error::ApiResult;
use crate::router::{open_conn, request_info, AppState, ConnectQuery};

pub async fn connect_sse(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    uri: Uri,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let open = query.into_open()?;
    let actor_id = ActorId::new(actor_id);
    let (driver, mut frames) = PushConnDriver::sse();
    let (events_tx, events_rx) = mpsc::unbounded_channel::<String>();
    let closed_by_server = Arc::new(AtomicBool::new(false));

    // Must run before the connect: `on_connect` failures close through it
    let closed = closed_by_server.clone();
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match frame {
                ConnFrame::Message(json) => {
                    if events_tx.send(json).is_err() {
                        break;
                    }
                }
                ConnFrame::Close { reason, ack } => {
                    closed.store(true, Ordering::SeqCst);
                    debug!("Closing event stream: {}", reason.as_deref().unwrap_or("no reason"));
                    // Dropping the sender ends the stream after queued events
                    let _ = ack.send(());
                    break;
                }
            }
        }
    });

    let connected = open_conn(
        &state.topology,
        &actor_id,
        open,
        request_info(&uri, &headers),
        Arc::new(driver),
    )
    .await?;
    info!("SSE conn {} opened on actor {}", connected.conn_id, actor_id);

    let guard = DisconnectGuard {
        topology: state.topology,
        actor_id,
        conn_id: connected.conn_id,
        closed_by_server,
    };
    let stream = futures::stream::unfold((events_rx, guard), |(mut events, guard)| async move {
        let json = events.recv().await?;
        Some((Ok(Event::default().data(json)), (events, guard)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Removes the conn from its actor once the client drops the response
/// stream. Streams ended by the server leave the conn alone: it is either
/// gone already or reattached to a newer transport.
struct DisconnectGuard {
    topology: SharedTopology,
    actor_id: ActorId,
    conn_id: ConnId,
    closed_by_server: Arc<AtomicBool>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.closed_by_server.load(Ordering::SeqCst) {
            debug!("SSE conn {} closed by the server", self.conn_id);
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let topology = self.topology.clone();
        let actor_id = self.actor_id.clone();
        let conn_id = self.conn_id.clone();
        handle.spawn(async move {
            if let Err(e) = topology.disconnect(&actor_id, &conn_id).await {
                debug!("Failed to remove conn {}: {}", conn_id, e);
            }
            info!("SSE conn {} closed on actor {}", conn_id, actor_id);
        });
    }
}
