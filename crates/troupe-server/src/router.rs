use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

use troupe::actor::parse_message;
use troupe::manager::ActorRecord;
use troupe::{ActorError, ActorId, ConnDriver, ConnId, ConnectedConn, RequestInfo, SharedTopology};

use crate::error::{ApiError, ApiResult};
use crate::{sse, websocket};

/// Header carrying the token of the connection a message is addressed to.
pub const CONN_TOKEN_HEADER: &str = "x-troupe-conn-token";

#[derive(Clone)]
pub struct AppState {
    pub topology: SharedTopology,
}

pub fn router(topology: SharedTopology) -> Router {
    Router::new()
        .route("/actors", post(get_or_create_actor))
        .route("/actors/{actor_id}/actions/{action}", post(execute_action))
        .route(
            "/actors/{actor_id}/connect/websocket",
            get(websocket::connect_websocket),
        )
        .route("/actors/{actor_id}/connect/sse", get(sse::connect_sse))
        .route(
            "/actors/{actor_id}/connections/{conn_id}/message",
            post(send_message),
        )
        .route("/actors/{actor_id}/raw/websocket", get(websocket::raw_websocket))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { topology })
}

#[derive(Debug, Deserialize)]
pub struct GetOrCreateRequest {
    pub name: String,
    #[serde(default)]
    pub key: Vec<String>,
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub output: Value,
}

async fn get_or_create_actor(
    State(state): State<AppState>,
    Json(request): Json<GetOrCreateRequest>,
) -> ApiResult<Json<ActorRecord>> {
    let record = state
        .topology
        .get_or_create(&request.name, &request.key, request.input)
        .await?;
    Ok(Json(record))
}

async fn execute_action(
    State(state): State<AppState>,
    Path((actor_id, action)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
    Json(request): Json<ActionRequest>,
) -> ApiResult<Json<ActionResponse>> {
    let output = state
        .topology
        .execute_action(
            &ActorId::new(actor_id),
            &action,
            request.args,
            request.params,
            request_info(&uri, &headers),
        )
        .await?;
    Ok(Json(ActionResponse { output }))
}

/// Out-of-band message for a connection whose transport cannot carry
/// client messages, such as SSE.
async fn send_message(
    State(state): State<AppState>,
    Path((actor_id, conn_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<StatusCode> {
    let conn_token = headers
        .get(CONN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(ActorError::IncorrectConnToken)?;
    let conn_id = ConnId::parse(&conn_id).map_err(|_| ActorError::ConnNotFound(conn_id.clone()))?;

    let max_size = state.topology.context().config.actor.max_incoming_message_size;
    let message = parse_message(&body, max_size)?;
    state
        .topology
        .send_message(&ActorId::new(actor_id), &conn_id, conn_token, message)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Query string of the connect routes. `params` is JSON; `conn_id` and
/// `conn_token` together reattach an existing connection.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub params: Option<String>,
    pub conn_id: Option<String>,
    pub conn_token: Option<String>,
}

pub(crate) enum ConnOpen {
    Fresh { params: Value },
    Reconnect { conn_id: ConnId, conn_token: String },
}

impl ConnectQuery {
    pub(crate) fn into_open(self) -> Result<ConnOpen, ApiError> {
        match (self.conn_id, self.conn_token) {
            (Some(conn_id), Some(conn_token)) => {
                let conn_id = ConnId::parse(&conn_id).map_err(|_| ActorError::ConnNotFound(conn_id.clone()))?;
                Ok(ConnOpen::Reconnect { conn_id, conn_token })
            }
            (None, None) => {
                let params = match self.params {
                    Some(raw) => serde_json::from_str(&raw)
                        .map_err(|e| ActorError::MalformedMessage(format!("params: {}", e)))?,
                    None => Value::Null,
                };
                Ok(ConnOpen::Fresh { params })
            }
            _ => Err(ActorError::MalformedMessage(
                "conn_id and conn_token must be given together".to_string(),
            )
            .into()),
        }
    }
}

pub(crate) async fn open_conn(
    topology: &SharedTopology,
    actor_id: &ActorId,
    open: ConnOpen,
    request: RequestInfo,
    driver: Arc<dyn ConnDriver>,
) -> Result<ConnectedConn, ActorError> {
    match open {
        ConnOpen::Fresh { params } => topology.connect(actor_id, params, request, driver).await,
        ConnOpen::Reconnect { conn_id, conn_token } => {
            debug!("Reattaching conn {} to actor {}", conn_id, actor_id);
            topology.reconnect(actor_id, &conn_id, &conn_token, driver).await
        }
    }
}

pub(crate) fn request_info(uri: &Uri, headers: &HeaderMap) -> RequestInfo {
    RequestInfo {
        url: Some(uri.to_string()),
        headers: header_map(headers),
    }
}

pub(crate) fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}
