use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Rejections raised before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("text is required")]
    EmptyText,
    #[error("identityId is required")]
    MissingIdentity,
    #[error("identity not found: {0}")]
    UnknownIdentity(String),
    #[error("invalid client token")]
    InvalidToken,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("message could not be stored: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("invalid webhook signature")]
    BadSignature,
    #[error("invalid webhook verification token")]
    BadVerifyToken,
    #[error("not a page event")]
    NotPageEvent,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(err) | ApiError::Ledger(LedgerError::Validation(err)) => {
                validation_status(err)
            }
            ApiError::Ledger(LedgerError::Store(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadSignature => StatusCode::UNAUTHORIZED,
            ApiError::BadVerifyToken => StatusCode::FORBIDDEN,
            ApiError::NotPageEvent => StatusCode::NOT_FOUND,
        }
    }
}

fn validation_status(err: &ValidationError) -> StatusCode {
    match err {
        ValidationError::UnknownIdentity(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
