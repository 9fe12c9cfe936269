use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::rate_limit::RateLimitDecision;

pub const SERVER_ERROR_MESSAGE: &str = "Server error";
pub const RATE_LIMITED_MESSAGE: &str = "Too many requests, please try again later.";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Rate limit exceeded")]
    RateLimited(RateLimitDecision),

    #[error("Rate limiter unavailable: {0}")]
    RateLimiter(String),

    #[error("Mail delivery failed: {0}")]
    Mail(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Validation(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            AppError::RateLimited(decision) => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({ "error": RATE_LIMITED_MESSAGE })),
                )
                    .into_response();
                decision.write_headers(response.headers_mut());
                response
            }
            other => {
                // Internals stay in the log, clients get a generic body
                error!("Request failed: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": SERVER_ERROR_MESSAGE })),
                )
                    .into_response()
            }
        }
    }
}
