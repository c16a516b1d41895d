//! HTTP error mapping
//!
//! Handlers return [`ApiError`]; the response body is always
//! `{"error": message}`. Upstream and internal failures get a fixed
//! user-facing message with the detail kept in the log, so raw upstream
//! text never reaches clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use charon_core::Error;

/// Wrapper turning control-plane errors into HTTP responses
#[derive(Debug)]
pub struct ApiError(pub Error);

/// Result alias for handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<charon_cloud::CloudError> for ApiError {
    fn from(err: charon_cloud::CloudError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            Error::Validation(m) => (StatusCode::BAD_REQUEST, m.clone()),
            Error::Conflict(m) => (StatusCode::BAD_REQUEST, m.clone()),
            Error::CapacityUnavailable(m) => (StatusCode::BAD_REQUEST, m.clone()),
            Error::Unauthenticated(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            Error::Forbidden(m) => (StatusCode::FORBIDDEN, m.clone()),
            Error::QuotaExhausted(m) => (StatusCode::FORBIDDEN, m.clone()),
            Error::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            Error::UpstreamTransient(m) | Error::UpstreamPermanent(m) => {
                tracing::error!(error = %m, "Upstream call failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "upstream provider error".to_string(),
                )
            }
            Error::Serialization(e) => {
                tracing::error!(error = %e, "Serialization failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            Error::Io(e) => {
                tracing::error!(error = %e, "IO failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            Error::Internal(m) => {
                tracing::error!(error = %m, "Internal failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let response = ApiError(Error::conflict("already has an active VM")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError(Error::quota_exhausted("over budget")).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = ApiError(Error::not_found("no such VM")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_upstream_detail_is_not_leaked() {
        let response =
            ApiError(Error::UpstreamPermanent("secret internal detail".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
