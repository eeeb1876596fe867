//! Shared surface between the gateway transports and their collaborators:
//! the typed API error taxonomy, identity snapshots, and the
//! authentication/permission traits.

pub mod auth;
pub mod error;

pub use auth::{AuthenticationResolver, BearerAuth, Identity, PermissionEngine};
pub use error::ApiError;
