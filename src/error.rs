//! 에러 타입 정의

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// 방 레지스트리 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("room not found")]
    NotFound,
    #[error("room is full ({max_members} members)")]
    CapacityExceeded { max_members: usize },
    #[error("no invite codes available")]
    CodesExhausted,
}

/// HTTP 응답용 에러
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    error: String,
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound => ApiError::NotFound("Room not found.".to_string()),
            RegistryError::CapacityExceeded { .. } => {
                ApiError::BadRequest("Room is full.".to_string())
            }
            RegistryError::CodesExhausted => {
                ApiError::Unavailable("No invite codes available. Try again later.".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let payload = ErrorPayload {
            error: self.to_string(),
        };
        (status, Json(payload)).into_response()
    }
}
