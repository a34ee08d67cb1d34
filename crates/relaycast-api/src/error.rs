//! JSON error responses

use axum::{http::StatusCode, Json};
use relaycast_common::Error;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub type ApiResult<T> = Result<T, ApiError>;

/// Build an error response with an explicit status
pub fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

/// Map a service error onto its HTTP response
pub fn api_error(err: Error) -> ApiError {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status.is_server_error() {
        error!(error = %err, "Request failed");
        // Storage details stay in the logs
        let message = match err {
            Error::Database(_) => "Database error".to_string(),
            other => other.to_string(),
        };
        return error_response(status, err_code(status), message);
    }

    error_response(status, err.code(), err.to_string())
}

/// Map a repository failure
pub fn db_error(err: sqlx::Error) -> ApiError {
    api_error(Error::Database(err.to_string()))
}

fn err_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_GATEWAY => "PROVIDER_ERROR",
        _ => "INTERNAL_ERROR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn maps_client_errors_with_their_code() {
        let (status, Json(body)) = api_error(Error::NotFound("Message x not found".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "NOT_FOUND");
        assert_eq!(body.message, "Not found: Message x not found");
    }

    #[test]
    fn hides_database_details() {
        let (status, Json(body)) = api_error(Error::Database("relation does not exist".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "INTERNAL_ERROR");
        assert_eq!(body.message, "Database error");
    }

    #[test]
    fn rate_limit_maps_to_429() {
        let (status, _) = api_error(Error::RateLimitExceeded {
            retry_after_secs: 5,
        });
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }
}
