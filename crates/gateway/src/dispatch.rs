//! Permission-filtered broadcast fan-out.
//!
//! The dispatcher is an explicit instance handed to emitting handlers; there
//! is no process-global pub/sub. Fan-out always operates on a registry
//! snapshot taken at the start of the call, so a connection closing
//! mid-broadcast is skipped, never a source of corruption. Delivery is
//! best-effort and at-most-once per recipient; a failed send to one
//! recipient never aborts delivery to the rest.

use axum::extract::ws::Message;
use common::PermissionEngine;
use metrics::counter;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionRegistry};
use crate::context::RequestContext;
use crate::protocol::{self, META_EVENT};

/// A state-change notification emitted by a handler after a mutating
/// operation commits. Ephemeral: never persisted, never retried.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    /// Acceptable permissions; empty means every connection is eligible.
    pub required_permissions: Vec<String>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            required_permissions: Vec::new(),
        }
    }

    /// Restrict delivery to connections holding one of these permissions.
    pub fn requiring(mut self, permissions: Vec<String>) -> Self {
        self.required_permissions = permissions;
        self
    }
}

/// Fans events out to the subset of connections that are both eligible and
/// reachable.
pub struct BroadcastDispatcher {
    registry: Arc<ConnectionRegistry>,
    permissions: Arc<dyn PermissionEngine>,
}

impl BroadcastDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, permissions: Arc<dyn PermissionEngine>) -> Self {
        Self {
            registry,
            permissions,
        }
    }

    /// Deliver an event to every connection other than the source whose
    /// scope satisfies the event's required permissions.
    ///
    /// The pushed envelope carries the source request's accumulated metadata
    /// plus the event name; caller-supplied meta keys are never overwritten.
    /// Returns the number of recipients reached.
    pub fn broadcast_event(&self, event: &Event, source: &RequestContext) -> usize {
        let recipients = self.registry.snapshot(|connection| {
            if Some(connection.id) == source.connection_id {
                return false;
            }
            if event.required_permissions.is_empty() {
                return true;
            }
            let identity = connection.identity();
            let scope = connection.scope();
            self.permissions
                .granted(&event.required_permissions, identity.as_ref(), &scope)
        });

        let mut meta = source.meta.clone();
        protocol::merge_missing(&mut meta, META_EVENT, json!(event.name));
        let envelope = protocol::success_envelope(event.payload.clone(), meta);

        counter!("gateway_events_broadcast_total").increment(1);
        self.deliver(&recipients, &envelope)
    }

    /// Deliver a payload to every connection subscribed to `topic`.
    ///
    /// Subscription is the sole gate here; access control for topic
    /// membership is enforced at subscribe time by the caller.
    pub fn broadcast_to_topic(&self, topic: &str, source: &RequestContext, payload: Value) -> usize {
        let recipients = self.registry.topic_snapshot(topic);
        let envelope = protocol::success_envelope(payload, source.meta.clone());

        counter!("gateway_events_broadcast_total").increment(1);
        self.deliver(&recipients, &envelope)
    }

    /// Serialize and write one message to one connection. A transport-level
    /// failure is logged and reported as `false`, never propagated.
    pub fn send(&self, connection: &Connection, message: &Value) -> bool {
        match serde_json::to_string(message) {
            Ok(json) => self.send_raw(connection, json),
            Err(err) => {
                warn!("Failed to serialize outbound message: {}", err);
                false
            }
        }
    }

    fn deliver(&self, recipients: &[Arc<Connection>], envelope: &Value) -> usize {
        if recipients.is_empty() {
            return 0;
        }

        // Serialize once per fan-out, not per recipient.
        let json = match serde_json::to_string(envelope) {
            Ok(json) => json,
            Err(err) => {
                warn!("Failed to serialize broadcast envelope: {}", err);
                return 0;
            }
        };

        let mut delivered = 0;
        for connection in recipients {
            if self.send_raw(connection, json.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    fn send_raw(&self, connection: &Connection, json: String) -> bool {
        match connection.try_send(Message::Text(json.into())) {
            Ok(()) => true,
            Err(_) => {
                debug!("Failed to deliver to connection {}", connection.id);
                counter!("gateway_send_failures_total").increment(1);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OUTBOUND_BUFFER_SIZE;
    use async_trait::async_trait;
    use common::{AuthenticationResolver, BearerAuth, Identity};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    /// Grants the `record.read` scope for the token "scoped", resolves
    /// nothing otherwise.
    struct ScopedResolver;

    #[async_trait]
    impl AuthenticationResolver for ScopedResolver {
        async fn bearer_authenticate(&self, token: &str) -> anyhow::Result<BearerAuth> {
            if token == "scoped" {
                Ok(BearerAuth {
                    identity: Some(Identity {
                        id: Uuid::new_v4(),
                        display: "scoped".to_string(),
                    }),
                    scope: vec!["record.read".to_string()],
                })
            } else {
                Ok(BearerAuth::default())
            }
        }
    }

    struct AnyOfEngine;

    impl PermissionEngine for AnyOfEngine {
        fn granted(
            &self,
            required: &[String],
            _identity: Option<&Identity>,
            scope: &[String],
        ) -> bool {
            required.iter().any(|p| scope.iter().any(|s| s == p))
        }
    }

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        dispatcher: BroadcastDispatcher,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(ScopedResolver)));
        let dispatcher = BroadcastDispatcher::new(registry.clone(), Arc::new(AnyOfEngine));
        Fixture {
            registry,
            dispatcher,
        }
    }

    fn open(fixture: &Fixture) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
        let connection = fixture.registry.register(tx, "127.0.0.1:4000".to_string());
        (connection, rx)
    }

    fn source_ctx(connection_id: Option<Uuid>) -> RequestContext {
        RequestContext {
            connection_id,
            remote_addr: "127.0.0.1:4000".to_string(),
            ..RequestContext::default()
        }
    }

    fn recv_envelope(rx: &mut mpsc::Receiver<Message>) -> Value {
        match rx.try_recv().expect("expected a delivered frame") {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn topic_broadcast_reaches_only_subscribers() {
        let fx = fixture();
        let (a, mut rx_a) = open(&fx);
        let (b, mut rx_b) = open(&fx);
        let (_c, mut rx_c) = open(&fx);

        fx.registry.subscribe(&a.id, "topic-1").unwrap();
        fx.registry.subscribe(&b.id, "topic-1").unwrap();

        let delivered =
            fx.dispatcher
                .broadcast_to_topic("topic-1", &source_ctx(None), json!({"seq": 1}));
        assert_eq!(delivered, 2);

        assert_eq!(recv_envelope(&mut rx_a)["result"]["seq"], json!(1));
        assert_eq!(recv_envelope(&mut rx_b)["result"]["seq"], json!(1));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn permission_gated_event_filters_by_scope() {
        let fx = fixture();
        let (privileged, mut rx_privileged) = open(&fx);
        let (_plain, mut rx_plain) = open(&fx);

        fx.registry.authenticate(&privileged.id, "scoped").await;
        assert!(privileged.is_authenticated());

        let event = Event::new("record.updated", json!({"id": 9}))
            .requiring(vec!["record.read".to_string()]);
        let delivered = fx.dispatcher.broadcast_event(&event, &source_ctx(None));

        // Only the connection whose scope holds the required permission
        // receives the event; the anonymous one never does.
        assert_eq!(delivered, 1);
        assert_eq!(
            recv_envelope(&mut rx_privileged)["meta"]["event"],
            json!("record.updated")
        );
        assert!(rx_plain.try_recv().is_err());
    }

    #[tokio::test]
    async fn event_excludes_the_source_connection() {
        let fx = fixture();
        let (source, mut rx_source) = open(&fx);
        let (_other, mut rx_other) = open(&fx);

        let event = Event::new("record.created", json!({"id": 1}));
        let delivered = fx
            .dispatcher
            .broadcast_event(&event, &source_ctx(Some(source.id)));

        assert_eq!(delivered, 1);
        assert!(rx_source.try_recv().is_err());
        let envelope = recv_envelope(&mut rx_other);
        assert_eq!(envelope["meta"]["event"], json!("record.created"));
        assert_eq!(envelope["result"]["id"], json!(1));
    }

    #[tokio::test]
    async fn dead_recipient_does_not_break_the_fan_out() {
        let fx = fixture();
        let (a, rx_a) = open(&fx);
        let (b, mut rx_b) = open(&fx);

        fx.registry.subscribe(&a.id, "topic-9").unwrap();
        fx.registry.subscribe(&b.id, "topic-9").unwrap();

        // Simulate a dead transport: the writer half is gone.
        drop(rx_a);

        let delivered =
            fx.dispatcher
                .broadcast_to_topic("topic-9", &source_ctx(None), json!({"seq": 2}));
        assert_eq!(delivered, 1);
        assert_eq!(recv_envelope(&mut rx_b)["result"]["seq"], json!(2));
    }

    #[tokio::test]
    async fn event_meta_is_caller_first_and_carries_source_meta() {
        let fx = fixture();
        let (_other, mut rx) = open(&fx);

        let mut source = source_ctx(None);
        source
            .meta
            .insert("event".to_string(), json!("caller-pinned"));
        source
            .meta
            .insert("Rate-Limit-Remaining".to_string(), json!(41));

        let event = Event::new("record.deleted", json!({}));
        fx.dispatcher.broadcast_event(&event, &source);

        let envelope = recv_envelope(&mut rx);
        assert_eq!(envelope["meta"]["event"], json!("caller-pinned"));
        assert_eq!(envelope["meta"]["Rate-Limit-Remaining"], json!(41));
    }

    #[tokio::test]
    async fn per_connection_delivery_preserves_call_order() {
        let fx = fixture();
        let (_other, mut rx) = open(&fx);

        let source = source_ctx(None);
        fx.dispatcher
            .broadcast_event(&Event::new("first", json!({"n": 1})), &source);
        fx.dispatcher
            .broadcast_event(&Event::new("second", json!({"n": 2})), &source);

        assert_eq!(recv_envelope(&mut rx)["result"]["n"], json!(1));
        assert_eq!(recv_envelope(&mut rx)["result"]["n"], json!(2));
    }
}
