//! Typed API error taxonomy shared by both transports.
//!
//! These are the only errors a client ever sees. Anything a handler raises
//! that is not one of these variants is wrapped into [`ApiError::Internal`]
//! at the router boundary, so internal detail never reaches the wire.

use serde_json::{json, Value};
use thiserror::Error;

/// Error surfaced to API clients, serialized as `{code, detail}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Malformed request shape or parameters.
    #[error("bad request: {0}")]
    Client(String),

    /// Invalid or expired credential. Never raised for a *missing*
    /// credential, which is treated as anonymous.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// No handler registered for the requested action tuple.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request quota exceeded for the caller's rate-limit key.
    #[error("rate limit exceeded")]
    RateLimit,

    /// Unexpected failure. The underlying cause is logged server-side and
    /// never serialized.
    #[error("internal server error")]
    Internal,
}

impl ApiError {
    /// Stable machine-readable code for the wire envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Client(_) => "bad_request",
            ApiError::Auth(_) => "unauthorized",
            ApiError::NotFound(_) => "not_found",
            ApiError::RateLimit => "rate_limit_exceeded",
            ApiError::Internal => "internal_server_error",
        }
    }

    /// HTTP status code equivalent, used by the request/response front.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Client(_) => 400,
            ApiError::Auth(_) => 401,
            ApiError::NotFound(_) => 404,
            ApiError::RateLimit => 429,
            ApiError::Internal => 500,
        }
    }

    /// Serialize as the `{code, detail}` object carried in the `errors`
    /// array of an error envelope.
    pub fn to_wire(&self) -> Value {
        json!({
            "code": self.code(),
            "detail": self.to_string(),
        })
    }

    pub fn client(detail: impl Into<String>) -> Self {
        ApiError::Client(detail.into())
    }

    pub fn auth(detail: impl Into<String>) -> Self {
        ApiError::Auth(detail.into())
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        ApiError::NotFound(detail.into())
    }
}
