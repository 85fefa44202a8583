use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use santa_core::SantaError;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("event {event_id} was written by someone else since it was read")]
    ConcurrentModification { event_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("persistence failure: {0}")]
    Persistence(StoreError),
    #[error("event {0} changed while you were editing it, reload and retry")]
    ConcurrentModification(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Core(#[from] SantaError),
    #[error("invalid or missing credentials")]
    Unauthorized,
    #[error("invalid or deactivated invitation link")]
    InvalidInvitation,
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrentModification { event_id } => {
                ServiceError::ConcurrentModification(event_id)
            }
            other => ServiceError::Persistence(other),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Persistence(err) => {
                error!(%err, "storage failure");
                return (StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable").into_response();
            }
            ServiceError::ConcurrentModification(_) | ServiceError::InvalidState(_) => {
                StatusCode::CONFLICT
            }
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Core(SantaError::Forbidden) => StatusCode::FORBIDDEN,
            ServiceError::Core(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized | ServiceError::InvalidInvitation => StatusCode::UNAUTHORIZED,
        };
        (status, self.to_string()).into_response()
    }
}
