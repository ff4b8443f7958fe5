//! HTTP mapping of the error taxonomy
//!
//! Handlers return `papi_common::Error` through this wrapper; the mapping
//! from kind to status code lives only here. Internal errors are logged
//! with full detail and answered with a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use papi_common::Error;

/// Result type for API handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Wrapper carrying taxonomy errors out of handlers
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            Error::AuthFailed { .. } => StatusCode::UNAUTHORIZED,
            Error::NotMember { .. } | Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::UnknownWorkload { .. } => StatusCode::NOT_FOUND,
            Error::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Backend { .. } => StatusCode::BAD_GATEWAY,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &err {
            Error::BadRequest { field, message } => json!({
                "error": err.kind(),
                "field": field,
                "detail": message,
            }),
            Error::QuotaExceeded {
                resource,
                limit,
                current,
            } => json!({
                "error": err.kind(),
                "resource": resource,
                "limit": limit,
                "current": current,
                "detail": err.to_string(),
            }),
            Error::Internal { message, context } => {
                // Full trace stays in the logs; the user gets a generic body
                error!(context = %context, detail = %message, "internal error");
                json!({
                    "error": err.kind(),
                    "detail": "an unexpected error occurred",
                })
            }
            _ => json!({
                "error": err.kind(),
                "detail": err.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_quota_exceeded_maps_to_429_with_numbers() {
        let response = ApiError(Error::quota("GPU", 1, 1)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_of(response).await;
        assert_eq!(body["resource"], "GPU");
        assert_eq!(body["limit"], 1);
        assert_eq!(body["current"], 1);
    }

    #[tokio::test]
    async fn test_bad_request_points_at_field() {
        let response =
            ApiError(Error::bad_request("hardware.ram", "out of range")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_of(response).await;
        assert_eq!(body["field"], "hardware.ram");
    }

    #[tokio::test]
    async fn test_internal_error_body_is_generic() {
        let response =
            ApiError(Error::internal("catalog", "poisoned lock at line 42")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_of(response).await;
        assert_eq!(body["detail"], "an unexpected error occurred");
        assert!(!body.to_string().contains("poisoned"));
    }

    #[tokio::test]
    async fn test_backend_error_passes_upstream_message() {
        let response = ApiError(Error::backend("nomad", "no nodes available")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_of(response).await;
        assert!(body["detail"].as_str().unwrap().contains("no nodes available"));
    }

    #[tokio::test]
    async fn test_status_codes() {
        for (err, status) in [
            (Error::auth("bad token"), StatusCode::UNAUTHORIZED),
            (Error::not_member("no VO"), StatusCode::FORBIDDEN),
            (Error::forbidden("not yours"), StatusCode::FORBIDDEN),
            (
                Error::unknown_workload("module", "x"),
                StatusCode::NOT_FOUND,
            ),
            (Error::timeout("nomad"), StatusCode::GATEWAY_TIMEOUT),
        ] {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }
}
