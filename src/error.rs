//! Request-path error taxonomy and HTTP response mapping.
//!
//! Only three shapes ever reach a client: 404, 429 and a generic 500.
//! A manifest that failed signature verification is reported as `NotFound`,
//! exactly like a version that never existed, so verification failures
//! cannot be used as an oracle for probing the catalog. Response bodies
//! carry no internal diagnostics.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Version/platform absent from the catalog, or excluded by a failed
    /// verification. Externally indistinguishable.
    #[error("not found")]
    NotFound,
    /// Client exceeded its request budget for this route class.
    #[error("too many requests")]
    RateLimited { retry_after_secs: u64 },
    /// Unexpected internal fault. The cause is logged, never returned.
    #[error("internal error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response()
            }
            ApiError::RateLimited { retry_after_secs } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "error": "too many requests",
                        "retry_after_secs": retry_after_secs,
                    })),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response(),
        }
    }
}
