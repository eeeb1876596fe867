//! Built-in gateway actions.
//!
//! Resource controllers register their own routes through the same
//! `add_route` surface at startup; these are the actions the gateway itself
//! owns: version discovery and topic subscription management.

use async_trait::async_trait;
use chrono::Utc;
use common::ApiError;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::connection::ConnectionRegistry;
use crate::context::RequestContext;
use crate::error::Result;
use crate::router::{ActionHandler, ActionRouter};

/// `version/read`: static build information. Also invoked to produce the
/// connection greeting.
pub struct VersionHandler;

#[async_trait]
impl ActionHandler for VersionHandler {
    async fn call(&self, _ctx: &mut RequestContext) -> anyhow::Result<Value> {
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "served_at": Utc::now().timestamp_millis(),
        }))
    }
}

/// `stream/subscribe`: opt the calling connection into a topic.
///
/// Access control for topic membership belongs here, at subscribe time;
/// topic broadcasts perform no further permission check at delivery.
pub struct SubscribeHandler {
    registry: Arc<ConnectionRegistry>,
}

impl SubscribeHandler {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ActionHandler for SubscribeHandler {
    async fn call(&self, ctx: &mut RequestContext) -> anyhow::Result<Value> {
        let (connection_id, topic) = stream_args(ctx)?;
        self.registry.subscribe(&connection_id, &topic)?;
        Ok(json!({ "id": topic }))
    }
}

/// `stream/unsubscribe`: drop the calling connection's topic subscription.
pub struct UnsubscribeHandler {
    registry: Arc<ConnectionRegistry>,
}

impl UnsubscribeHandler {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ActionHandler for UnsubscribeHandler {
    async fn call(&self, ctx: &mut RequestContext) -> anyhow::Result<Value> {
        let (connection_id, topic) = stream_args(ctx)?;
        self.registry.unsubscribe(&connection_id, &topic)?;
        Ok(json!({ "id": topic }))
    }
}

fn stream_args(ctx: &RequestContext) -> std::result::Result<(uuid::Uuid, String), ApiError> {
    let topic = ctx
        .param_str("id")
        .ok_or_else(|| ApiError::client("missing 'id' parameter"))?
        .to_string();
    let connection_id = ctx.connection_id.ok_or_else(|| {
        ApiError::client("stream subscriptions require a persistent connection")
    })?;
    Ok((connection_id, topic))
}

/// Register the gateway's own routes. Called once at startup, before any
/// connection is accepted.
pub fn register_builtin_routes(
    router: &mut ActionRouter,
    registry: Arc<ConnectionRegistry>,
) -> Result<()> {
    router.add_route("version", "read", Arc::new(VersionHandler))?;
    router.add_route(
        "stream",
        "subscribe",
        Arc::new(SubscribeHandler::new(registry.clone())),
    )?;
    router.add_route(
        "stream",
        "unsubscribe",
        Arc::new(UnsubscribeHandler::new(registry)),
    )?;
    Ok(())
}
