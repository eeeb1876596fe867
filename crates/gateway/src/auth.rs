//! Default collaborator implementations.
//!
//! Production deployments plug real identity and permission stores in
//! through the traits in `common::auth`; these defaults back development
//! setups and tests.

use async_trait::async_trait;
use common::{AuthenticationResolver, BearerAuth, Identity, PermissionEngine};
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

/// Resolver backed by a static token table.
///
/// Entry format: `token=display:scope1|scope2`, entries separated by
/// commas. Unknown tokens resolve to anonymous.
pub struct StaticTokenResolver {
    tokens: HashMap<String, (Identity, Vec<String>)>,
}

impl StaticTokenResolver {
    pub fn parse(raw: &str) -> Self {
        let mut tokens = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((token, rest)) = entry.split_once('=') else {
                warn!("Ignoring malformed token entry");
                continue;
            };
            let (display, scopes) = rest.split_once(':').unwrap_or((rest, ""));
            let scope: Vec<String> = scopes
                .split('|')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            tokens.insert(
                token.to_string(),
                (
                    Identity {
                        id: Uuid::new_v4(),
                        display: display.to_string(),
                    },
                    scope,
                ),
            );
        }
        Self { tokens }
    }

    /// Read the token table from the `GATEWAY_TOKENS` environment variable.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("GATEWAY_TOKENS").unwrap_or_default())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl AuthenticationResolver for StaticTokenResolver {
    async fn bearer_authenticate(&self, token: &str) -> anyhow::Result<BearerAuth> {
        Ok(match self.tokens.get(token) {
            Some((identity, scope)) => BearerAuth {
                identity: Some(identity.clone()),
                scope: scope.clone(),
            },
            None => BearerAuth::default(),
        })
    }
}

/// Grants a requirement when any one of the required permissions appears in
/// the caller's scope. Anonymous callers carry an empty scope and are
/// denied by construction.
pub struct ScopePermissionEngine;

impl PermissionEngine for ScopePermissionEngine {
    fn granted(&self, required: &[String], _identity: Option<&Identity>, scope: &[String]) -> bool {
        required
            .iter()
            .any(|permission| scope.iter().any(|granted| granted == permission))
    }
}
