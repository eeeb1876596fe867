//! Identity and the authentication/permission collaborator traits.
//!
//! The gateway never stores identities or permissions itself. It consumes
//! them through these seams: a resolver that turns a bearer token into an
//! identity snapshot, and an engine that answers permission checks against
//! that snapshot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable identity snapshot attached to a connection at authentication
/// time. A connection never re-resolves its identity after attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// User id.
    pub id: Uuid,
    /// Human-readable label, used only for logging.
    pub display: String,
}

/// Result of resolving a bearer token.
///
/// `identity: None` means the token did not resolve; the caller treats the
/// session as anonymous (best-effort upgrade semantics).
#[derive(Debug, Clone, Default)]
pub struct BearerAuth {
    pub identity: Option<Identity>,
    pub scope: Vec<String>,
}

/// Resolves a bearer token to an identity and permission scope.
///
/// Resolution may suspend on I/O (e.g. a lookup against a session store).
#[async_trait]
pub trait AuthenticationResolver: Send + Sync + 'static {
    async fn bearer_authenticate(&self, token: &str) -> anyhow::Result<BearerAuth>;
}

/// Answers whether an identity's scope satisfies a required permission set.
///
/// The required set lists acceptable permissions: holding any one of them
/// grants access. An empty scope never satisfies a non-empty requirement,
/// so anonymous connections are denied by default.
pub trait PermissionEngine: Send + Sync + 'static {
    fn granted(&self, required: &[String], identity: Option<&Identity>, scope: &[String]) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AnyOf;

    impl PermissionEngine for AnyOf {
        fn granted(
            &self,
            required: &[String],
            _identity: Option<&Identity>,
            scope: &[String],
        ) -> bool {
            required.iter().any(|p| scope.iter().any(|s| s == p))
        }
    }

    #[test]
    fn empty_scope_is_denied() {
        let engine = AnyOf;
        assert!(!engine.granted(&["user.read".into()], None, &[]));
    }
}
