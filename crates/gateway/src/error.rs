//! Gateway-internal error types.
//!
//! These never cross the wire; client-visible failures are expressed as
//! [`common::ApiError`] values instead.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection not found in the registry.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// An action tuple was registered twice. Raised at startup, before any
    /// traffic is served.
    #[error("duplicate route registration: {0}/{1}")]
    DuplicateRoute(String, String),

    /// Outbound channel send error (connection gone or buffer full).
    #[error("channel send error")]
    ChannelSend,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
