use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("gone: {0}")]
    Gone(String),

    #[error("session limit reached: {0}")]
    SessionLimit(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg })),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": "unauthorized" }),
            ),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                serde_json::json!({ "error": "forbidden" }),
            ),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            Self::Gone(msg) => (StatusCode::GONE, serde_json::json!({ "error": msg })),
            Self::SessionLimit(msg) => (
                StatusCode::TOO_MANY_REQUESTS,
                serde_json::json!({ "error": msg }),
            ),
            Self::UpstreamUnavailable(msg) => {
                (StatusCode::BAD_GATEWAY, serde_json::json!({ "error": msg }))
            }
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "internal server error" }),
                )
            }
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        tracing::error!(error = %err, "kubernetes error");
        Self::Internal(err.into())
    }
}

impl From<crate::driver::DriverError> for ApiError {
    fn from(err: crate::driver::DriverError) -> Self {
        use crate::driver::DriverError;
        match err {
            DriverError::NotReady(msg) => Self::UpstreamUnavailable(msg),
            other => {
                tracing::error!(error = %other, "driver error");
                Self::Internal(other.into())
            }
        }
    }
}

impl From<crate::session::SessionError> for ApiError {
    fn from(err: crate::session::SessionError) -> Self {
        use crate::session::SessionError;
        match err {
            SessionError::NotFound(id) => Self::NotFound(format!("session {id}")),
            SessionError::InvalidScope(msg) => Self::BadRequest(msg),
            SessionError::BackendUnavailable(msg) | SessionError::NotReachable(msg) => {
                Self::UpstreamUnavailable(msg)
            }
            SessionError::Internal(e) => Self::Internal(e),
        }
    }
}
