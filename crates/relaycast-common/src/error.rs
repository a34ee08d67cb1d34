//! Error types for Relaycast

use thiserror::Error;

/// Main error type for Relaycast
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Relaycast
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Auth(_) => 401,
            Error::Validation(_) => 422,
            Error::NotFound(_) => 404,
            Error::PermissionDenied(_) => 403,
            Error::Conflict(_) => 409,
            Error::RateLimitExceeded { .. } => 429,
            Error::Provider(_) => 502,
            Error::Internal(_) => 500,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Auth(_) => "UNAUTHORIZED",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::PermissionDenied(_) => "FORBIDDEN",
            Error::Conflict(_) => "CONFLICT",
            Error::RateLimitExceeded { .. } => "RATE_LIMITED",
            Error::Provider(_) => "PROVIDER_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::NotFound("message".into()).status_code(), 404);
        assert_eq!(Error::Conflict("dup".into()).status_code(), 409);
        assert_eq!(
            Error::RateLimitExceeded {
                retry_after_secs: 12
            }
            .status_code(),
            429
        );
        assert_eq!(Error::Validation("bad".into()).code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_rate_limit_message_includes_retry_after() {
        let err = Error::RateLimitExceeded {
            retry_after_secs: 30,
        };
        assert_eq!(err.to_string(), "Rate limit exceeded, retry after 30s");
    }
}
