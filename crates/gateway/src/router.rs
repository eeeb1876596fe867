//! Transport-agnostic action routing.
//!
//! One router instance is constructed at startup, populated with explicit
//! `add_route` calls, and shared by reference between the persistent and
//! request/response fronts, so every action behaves identically regardless
//! of origin.

use async_trait::async_trait;
use common::ApiError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

use crate::context::RequestContext;
use crate::error::{GatewayError, Result};

/// A routable operation. Implementations raise [`ApiError`] for failures a
/// client should see; any other error is wrapped at the router boundary.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn call(&self, ctx: &mut RequestContext) -> anyhow::Result<Value>;
}

impl std::fmt::Debug for dyn ActionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ActionHandler")
    }
}

/// Maps `(endpoint, method)` tuples to handlers.
#[derive(Default)]
pub struct ActionRouter {
    routes: HashMap<(String, String), Arc<dyn ActionHandler>>,
}

impl ActionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an action tuple. Registration happens only at
    /// startup; a duplicate tuple is a configuration error, not a runtime
    /// one.
    pub fn add_route(
        &mut self,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<()> {
        let key = (endpoint.into(), method.into());
        if self.routes.contains_key(&key) {
            return Err(GatewayError::DuplicateRoute(key.0, key.1));
        }
        self.routes.insert(key, handler);
        Ok(())
    }

    /// Resolve a handler. Fails with NotFound exactly when no handler is
    /// registered for that exact tuple.
    pub fn resolve(
        &self,
        endpoint: &str,
        method: &str,
    ) -> std::result::Result<Arc<dyn ActionHandler>, ApiError> {
        self.routes
            .get(&(endpoint.to_string(), method.to_string()))
            .cloned()
            .ok_or_else(|| ApiError::not_found("action"))
    }

    /// Resolve and invoke the handler for an action tuple.
    ///
    /// Typed API errors pass through unchanged; anything else a handler
    /// raises is logged and wrapped into an opaque internal error.
    pub async fn invoke(
        &self,
        endpoint: &str,
        method: &str,
        ctx: &mut RequestContext,
    ) -> std::result::Result<Value, ApiError> {
        let handler = self.resolve(endpoint, method)?;
        match handler.call(ctx).await {
            Ok(result) => Ok(result),
            Err(err) => match err.downcast::<ApiError>() {
                Ok(api_error) => Err(api_error),
                Err(other) => {
                    error!("Handler {}/{} failed: {:?}", endpoint, method, other);
                    Err(ApiError::Internal)
                }
            },
        }
    }

    /// Number of registered routes.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}
