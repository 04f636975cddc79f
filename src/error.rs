use axum::http::header::CONTENT_RANGE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("range not satisfiable")]
    RangeNotSatisfiable { size: u64 },

    #[error("no backend session available")]
    PoolUnavailable,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Errors that indicate a fault on our side rather than a bad request.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, ProxyError::Upstream(_) | ProxyError::Internal(_))
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let code = match &self {
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ProxyError::PoolUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if let ProxyError::RangeNotSatisfiable { size } = self {
            return (
                code,
                [(CONTENT_RANGE, format!("bytes */{size}"))],
                self.to_string(),
            )
                .into_response();
        }
        (code, self.to_string()).into_response()
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
