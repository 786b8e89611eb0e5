use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, error};

use troupe::ActorError;

/// An [`ActorError`] rendered as an HTTP response. Internal errors are
/// masked; the details only reach the server log.
#[derive(Debug)]
pub struct ApiError(pub ActorError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<ActorError> for ApiError {
    fn from(error: ActorError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Request failed: {:?}", self.0);
        } else {
            debug!("Request rejected: {}", self.0);
        }
        (status, Json(self.0.serialize(false))).into_response()
    }
}
