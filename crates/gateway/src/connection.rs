//! Connection state and registry.
//!
//! Every live session is an explicit `Connection` record owned by the
//! registry; the socket handle never carries state. Registries use DashMap
//! so contention is confined to per-key critical sections, and broadcast
//! paths only ever see point-in-time snapshots.

use axum::extract::ws::Message;
use chrono::Utc;
use common::{AuthenticationResolver, BearerAuth, Identity};
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Outbound buffer per connection. Bounded so a slow client sheds messages
/// instead of growing the heap.
pub const OUTBOUND_BUFFER_SIZE: usize = 256;

/// A live persistent session between a client and the gateway.
///
/// The identity is attached at most once for the connection's lifetime;
/// there is no downgrade back to anonymous.
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::Sender<Message>,
    identity: RwLock<Option<Identity>>,
    scope: RwLock<Vec<String>>,
    pub subscriptions: DashSet<String>,
    /// Forwarded-header value when present, else the transport peer address.
    pub remote_addr: String,
    pub connected_at: i64,
    last_seen: AtomicI64,
}

impl Connection {
    fn new(tx: mpsc::Sender<Message>, remote_addr: String) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            tx,
            identity: RwLock::new(None),
            scope: RwLock::new(Vec::new()),
            subscriptions: DashSet::new(),
            remote_addr,
            connected_at: now,
            last_seen: AtomicI64::new(now),
        }
    }

    /// Identity snapshot, if authenticated.
    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().unwrap().clone()
    }

    /// Permission scopes, empty if anonymous.
    pub fn scope(&self) -> Vec<String> {
        self.scope.read().unwrap().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.read().unwrap().is_some()
    }

    /// Attach an identity. The first attachment wins; a second one is a
    /// no-op and returns false.
    fn attach_identity(&self, identity: Identity, scope: Vec<String>) -> bool {
        let mut slot = self.identity.write().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(identity);
        *self.scope.write().unwrap() = scope;
        true
    }

    /// Queue a raw message for this connection's writer task.
    ///
    /// Non-blocking: a full buffer or closed channel is reported as a send
    /// error, never awaited on.
    pub fn try_send(&self, msg: Message) -> Result<()> {
        self.tx.try_send(msg).map_err(|_| GatewayError::ChannelSend)
    }

    /// Serialize a JSON value and queue it as a text frame.
    pub fn send_json(&self, value: &Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.try_send(Message::Text(json.into()))
    }

    /// Record inbound activity for stale-connection sweeping.
    pub fn touch(&self) {
        self.last_seen
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }
}

/// Registry of live connections and their topic subscriptions.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// Topic id → subscriber ids.
    topics: DashMap<String, DashSet<ConnectionId>>,
    resolver: Arc<dyn AuthenticationResolver>,
}

impl ConnectionRegistry {
    pub fn new(resolver: Arc<dyn AuthenticationResolver>) -> Self {
        Self {
            connections: DashMap::new(),
            topics: DashMap::new(),
            resolver,
        }
    }

    /// Create an anonymous connection. The entry is visible to lookups
    /// immediately.
    pub fn register(&self, tx: mpsc::Sender<Message>, remote_addr: String) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(tx, remote_addr));
        self.connections.insert(connection.id, connection.clone());
        info!(
            "Connection {} registered from {}",
            connection.id, connection.remote_addr
        );
        connection
    }

    /// Best-effort authentication upgrade.
    ///
    /// On success the identity and scope are attached to the connection. A
    /// token that does not resolve, or a resolver failure, leaves the
    /// connection anonymous; no error is surfaced to the transport.
    pub async fn authenticate(&self, id: &ConnectionId, token: &str) {
        let Some(connection) = self.get(id) else {
            return;
        };

        match self.resolver.bearer_authenticate(token).await {
            Ok(BearerAuth {
                identity: Some(identity),
                scope,
            }) => {
                let display_name = identity.display.clone();
                if connection.attach_identity(identity, scope) {
                    info!("Connection {} authenticated as {}", id, display_name);
                } else {
                    debug!("Connection {} already authenticated, upgrade ignored", id);
                }
            }
            Ok(BearerAuth { identity: None, .. }) => {
                debug!("Bearer token for connection {} did not resolve", id);
            }
            Err(err) => {
                debug!("Bearer resolution failed for connection {}: {:?}", id, err);
            }
        }
    }

    /// Subscribe a connection to a topic. Idempotent.
    pub fn subscribe(&self, id: &ConnectionId, topic: &str) -> Result<()> {
        let connection = self
            .get(id)
            .ok_or_else(|| GatewayError::ConnectionNotFound(id.to_string()))?;

        connection.subscriptions.insert(topic.to_string());
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(*id);

        debug!("Connection {} subscribed to {}", id, topic);
        Ok(())
    }

    /// Remove a connection's subscription to a topic. Idempotent.
    pub fn unsubscribe(&self, id: &ConnectionId, topic: &str) -> Result<()> {
        let connection = self
            .get(id)
            .ok_or_else(|| GatewayError::ConnectionNotFound(id.to_string()))?;

        connection.subscriptions.remove(topic);
        if let Some(subscribers) = self.topics.get(topic) {
            subscribers.remove(id);
        }
        self.topics.remove_if(topic, |_, subscribers| subscribers.is_empty());

        debug!("Connection {} unsubscribed from {}", id, topic);
        Ok(())
    }

    /// Remove a connection from the main table and from every topic
    /// subscriber set.
    ///
    /// Safe to call while a broadcast snapshot referencing the connection is
    /// in flight: the snapshot holds its own Arc, and a late send only fails
    /// the per-recipient channel, which the dispatcher logs and skips.
    pub fn deregister(&self, id: &ConnectionId) {
        if let Some((_, connection)) = self.connections.remove(id) {
            for topic in connection.subscriptions.iter() {
                if let Some(subscribers) = self.topics.get(topic.key()) {
                    subscribers.remove(id);
                }
                self.topics
                    .remove_if(topic.key(), |_, subscribers| subscribers.is_empty());
            }
            info!("Connection {} deregistered", id);
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| c.clone())
    }

    /// Point-in-time copy of all connections matching a predicate. Never a
    /// live view: mutations after the call do not affect the result.
    pub fn snapshot(&self, predicate: impl Fn(&Connection) -> bool) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Point-in-time copy of the connections subscribed to a topic. A
    /// subscriber deregistered between index lookup and collection is
    /// silently skipped.
    pub fn topic_snapshot(&self, topic: &str) -> Vec<Arc<Connection>> {
        let Some(subscribers) = self.topics.get(topic) else {
            return Vec::new();
        };
        subscribers
            .iter()
            .filter_map(|id| self.connections.get(&*id).map(|c| c.clone()))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of topics with at least one subscriber.
    pub fn subscription_count(&self) -> usize {
        self.topics.len()
    }

    /// Deregister connections with no inbound activity within `max_idle_ms`.
    /// A close frame is queued so the connection task tears itself down.
    pub fn cleanup_stale(&self, max_idle_ms: i64) {
        let now = Utc::now().timestamp_millis();
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| now - entry.value().last_seen_ms() > max_idle_ms)
            .map(|entry| *entry.key())
            .collect();

        for id in stale {
            warn!("Removing stale connection {}", id);
            if let Some(connection) = self.get(&id) {
                let _ = connection.try_send(Message::Close(None));
            }
            self.deregister(&id);
        }
    }
}
