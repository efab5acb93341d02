use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

/// Error as it leaves the HTTP surface. Everything a handler can fail with is
/// funnelled into one of these before serialization.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_seconds: Option<u64>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: message.into(),
            code: Some("rate_limit"),
            retry_after_seconds,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

/// Outcome taxonomy of a conversion. Validation failures never reach this
/// type; they are rejected before the orchestrator runs.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Video exceeds the maximum allowed duration of {limit_minutes} minutes.")]
    DurationExceeded { limit_minutes: u64 },
    /// Retries exhausted on a failure that looked like rate limiting or bot
    /// detection. Carries a summary of the last underlying error.
    #[error("The source kept rejecting the request: {0}")]
    RateLimited(String),
    /// Retries exhausted on anything else the downloader reported.
    #[error("Download failed: {0}")]
    FetchFailed(String),
    /// Unexpected condition. The detail is logged; clients get a generic body.
    #[error("{0}")]
    Internal(String),
}

impl From<ConvertError> for ApiError {
    fn from(error: ConvertError) -> Self {
        match error {
            ConvertError::DurationExceeded { .. } => ApiError::bad_request(error.to_string()),
            ConvertError::RateLimited(_) => ApiError::rate_limited(error.to_string(), None),
            ConvertError::FetchFailed(_) => ApiError::bad_request(error.to_string()),
            ConvertError::Internal(detail) => {
                error!("conversion failed unexpectedly: {detail}");
                ApiError::internal("Internal server error.")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_maps_to_429_with_machine_code() {
        let api: ApiError = ConvertError::RateLimited("HTTP Error 429".to_string()).into();
        assert_eq!(api.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(api.code, Some("rate_limit"));
    }

    #[test]
    fn internal_detail_is_masked_from_clients() {
        let api: ApiError = ConvertError::Internal("disk exploded at /srv".to_string()).into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.message, "Internal server error.");
    }

    #[test]
    fn duration_exceeded_is_a_client_error() {
        let api: ApiError = ConvertError::DurationExceeded { limit_minutes: 150 }.into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert!(api.message.contains("150"));
    }
}
