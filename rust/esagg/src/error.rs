use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A query definition is structurally incomplete and cannot be compiled.
    #[error("invalid query definition: {0}")]
    InvalidDefinition(String),

    /// The search engine reported an error for a query.
    #[error("{0}")]
    Engine(String),

    /// The response tree does not match the shape the query asked for.
    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub(crate) fn definition(message: impl Into<String>) -> Self {
        Self::InvalidDefinition(message.into())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest(_) | ServiceError::InvalidDefinition(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Engine(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if !matches!(
            self,
            ServiceError::InvalidRequest(_) | ServiceError::InvalidDefinition(_) | ServiceError::Auth
        ) {
            error!(error = %self, "request failed");
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
