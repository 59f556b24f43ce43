//! Error types for the auth proxy

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the auth proxy
pub type Result<T> = std::result::Result<T, Error>;

/// Auth proxy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation requires an authenticated (non-anonymous) caller
    #[error("Authentication required")]
    Unauthenticated,

    /// Credential present but not in a recognised form
    #[error("Malformed credential: {0}")]
    Malformed(String),

    /// Credential well-formed but rejected by the store or provider
    #[error("Invalid credential: {0}")]
    Invalid(String),

    /// Token issuance denied by the per-owner quota
    #[error("Too many tokens (maximum {max})")]
    QuotaExceeded {
        /// Configured maximum tokens per owner
        max: usize,
    },

    /// Caller is authenticated but not allowed to perform the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Request is missing a required parameter
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Key absent from the token store (distinct from backend failure)
    #[error("Not found")]
    NotFound,

    /// Backend or transport unavailable
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Upstream API server unreachable or failed mid-request
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Unrecoverable failure; the process must exit
    #[error("Fatal: {0}")]
    Fatal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable kind, used as the `error` field of JSON responses
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Unauthenticated => "unauthenticated",
            Self::Malformed(_) => "malformed_credential",
            Self::Invalid(_) => "invalid_credential",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Forbidden(_) => "forbidden",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound => "not_found",
            Self::Unavailable(_) | Self::Http(_) | Self::Redis(_) => "unavailable",
            Self::Upstream(_) => "bad_gateway",
            Self::Fatal(_) => "fatal",
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => "internal",
        }
    }

    /// Convert to the HTTP status reported to the caller
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated | Self::Malformed(_) | Self::Invalid(_) => {
                StatusCode::UNAUTHORIZED
            }
            Self::QuotaExceeded { .. } | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unavailable(_) | Self::Http(_) | Self::Redis(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error means the caller failed to authenticate
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::Unauthenticated | Self::Malformed(_) | Self::Invalid(_)
        )
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));

        if status == StatusCode::UNAUTHORIZED {
            (status, [("WWW-Authenticate", "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
