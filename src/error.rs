use axum::{http::StatusCode, response::IntoResponse, Json};

/// Service-wide error type. Admission errors are surfaced synchronously at
/// enqueue time; everything the worker hits after admission lands on the
/// ledger row instead of bubbling out of a request handler.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("unknown chain: {0}")]
    UnknownChain(u64),
    #[error("unknown wallet: {0}")]
    UnknownWallet(String),
    #[error("nonce allocation failed: {0}")]
    NonceAllocation(String),
    #[error("signing failed: {0}")]
    Signer(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    /// Transient failures the broadcast worker is allowed to retry.
    /// Admission and state-machine errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Signer(_) | ServiceError::Provider(_) | ServiceError::Database(_)
        )
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => ServiceError::NotFound("row not found".to_string()),
            other => ServiceError::Database(other.to_string()),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            ServiceError::UnknownChain(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServiceError::UnknownWallet(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServiceError::NonceAllocation(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            ServiceError::Signer(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            ServiceError::Provider(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            ServiceError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            ServiceError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServiceError::IllegalTransition(_) => (StatusCode::CONFLICT, self.to_string()),
            ServiceError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
