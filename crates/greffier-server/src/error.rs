use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use greffier_pipeline::PipelineError;
use greffier_shared::CryptoError;
use greffier_store::StoreError;
use greffier_vault::VaultError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing or invalid authorization")]
    Auth,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Failed to unwrap key")]
    KeyUnwrap,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Auth => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::KeyUnwrap => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound("record".to_string()),
            StoreError::KeyUnwrap(_) => ApiError::KeyUnwrap,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<VaultError> for ApiError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::NotFound(path) => ApiError::NotFound(path),
            VaultError::InvalidPath(path) => ApiError::BadRequest(format!("invalid path: {path}")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<CryptoError> for ApiError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::PubKeyFormat(message) => {
                ApiError::BadRequest(format!("Invalid public key: {message}"))
            }
            CryptoError::KeyUnwrap => ApiError::KeyUnwrap,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::InvalidState(message) => ApiError::BadRequest(message),
            PipelineError::NotTranscriptRevision(_) => ApiError::BadRequest(e.to_string()),
            PipelineError::Store(inner) => inner.into(),
            PipelineError::Vault(inner) => inner.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
