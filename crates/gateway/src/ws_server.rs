//! WebSocket front: connection lifecycle and the per-message action
//! pipeline.
//!
//! Each connection runs an independent task; handlers never block on I/O.
//! Authentication, handler invocation, and sends all suspend at awaits, so
//! one slow connection cannot stall the others.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use common::{ApiError, AuthenticationResolver};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionRegistry, OUTBOUND_BUFFER_SIZE};
use crate::context::{originating_address, RequestContext};
use crate::dispatch::BroadcastDispatcher;
use crate::protocol::{self, RequestEnvelope, META_EVENT};
use crate::rate_limit::{RateKey, RateLimiter};
use crate::router::ActionRouter;

/// Upper bound on envelopes queued while a connection's bearer upgrade is
/// still resolving. Overflow is dropped and logged, never buffered
/// unboundedly.
pub const PENDING_AUTH_QUEUE_LIMIT: usize = 32;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state, wired once at startup and handed to both
/// fronts.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<ActionRouter>,
    pub limiter: Arc<RateLimiter>,
    pub dispatcher: Arc<BroadcastDispatcher>,
    pub resolver: Arc<dyn AuthenticationResolver>,
}

/// Create the WebSocket-facing router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = state.registry.connection_count();
    let subscriptions = state.registry.subscription_count();
    format!(
        r#"{{"status":"ok","connections":{},"subscriptions":{}}}"#,
        connections, subscriptions
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let bearer = query.get("bearer").cloned();
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok());
    let remote_addr = originating_address(forwarded, &peer.to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, bearer, remote_addr))
}

/// Drive one connection from registration to cleanup.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    bearer: Option<String>,
    remote_addr: String,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER_SIZE);
    let connection = state.registry.register(tx, remote_addr);
    let connection_id = connection.id;

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.connection_count() as f64);

    // Writer task: pump the outbound channel into the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Optional bearer upgrade. While it resolves, inbound envelopes queue up
    // to a bound; without a token the greeting goes out immediately.
    let mut auth: Option<Pin<Box<dyn Future<Output = ()> + Send>>> = match bearer {
        Some(token) => {
            let registry = state.registry.clone();
            Some(Box::pin(async move {
                registry.authenticate(&connection_id, &token).await;
            }))
        }
        None => None,
    };
    let mut pending: Vec<Message> = Vec::new();

    if auth.is_none() {
        send_greeting(&state, &connection).await;
    }

    let mut ping_interval = interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = async { auth.as_mut().unwrap().await }, if auth.is_some() => {
                auth = None;
                send_greeting(&state, &connection).await;
                for msg in pending.drain(..) {
                    handle_message(&state, &connection, msg).await;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        connection.touch();
                        if matches!(msg, Message::Close(_)) {
                            break;
                        }
                        if auth.is_some() && matches!(msg, Message::Text(_) | Message::Binary(_)) {
                            if pending.len() < PENDING_AUTH_QUEUE_LIMIT {
                                pending.push(msg);
                            } else {
                                warn!(
                                    "Connection {} overflowed its pre-auth queue, dropping message",
                                    connection_id
                                );
                            }
                        } else {
                            handle_message(&state, &connection, msg).await;
                        }
                    }
                    Some(Err(err)) => {
                        warn!("WebSocket error for {}: {:?}", connection_id, err);
                        break;
                    }
                    None => {
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if connection.try_send(Message::Ping(vec![].into())).is_err() {
                    break;
                }
            }
        }
    }

    // Cancellation is connection-scoped: only this connection's writer task
    // and pending queue go away; other connections' in-flight work is
    // untouched.
    state.registry.deregister(&connection_id);
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.connection_count() as f64);

    info!("Connection {} closed", connection_id);
}

/// Handle a single WebSocket frame.
async fn handle_message(state: &Arc<AppState>, connection: &Arc<Connection>, msg: Message) {
    match msg {
        Message::Text(text) => handle_payload(state, connection, text.as_bytes()).await,
        Message::Binary(data) => handle_payload(state, connection, &data).await,
        Message::Ping(data) => {
            let _ = connection.try_send(Message::Pong(data));
        }
        Message::Pong(_) => {}
        Message::Close(_) => {}
    }
}

/// Parse an inbound envelope and run it through the action pipeline.
///
/// Unparseable payloads are logged and dropped; the connection stays open.
async fn handle_payload(state: &Arc<AppState>, connection: &Arc<Connection>, payload: &[u8]) {
    let envelope: RequestEnvelope = match serde_json::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            info!(
                "Failed to parse inbound message on {}: {}",
                connection.id, err
            );
            return;
        }
    };

    counter!("gateway_messages_total").increment(1);
    let response = process_envelope(state, connection, envelope).await;
    if connection.send_json(&response).is_err() {
        debug!("Failed to respond on connection {}", connection.id);
    }
}

/// The per-message pipeline: quota, context, route, respond.
async fn process_envelope(
    state: &Arc<AppState>,
    connection: &Arc<Connection>,
    envelope: RequestEnvelope,
) -> Value {
    let identity = connection.identity();
    let scope = connection.scope();

    // Caller meta first; gateway keys never overwrite it.
    let mut meta = envelope.meta.clone();

    let key = RateKey::derive(identity.as_ref(), &connection.remote_addr);
    let status = state.limiter.check(&key);
    protocol::merge_standard_meta(&mut meta, &status);

    if status.exceeded {
        counter!("gateway_rate_limited_total").increment(1);
        return protocol::error_envelope(&ApiError::RateLimit, meta);
    }

    let mut ctx = match RequestContext::new(
        Some(connection.id),
        connection.remote_addr.clone(),
        identity,
        scope,
        &envelope,
    ) {
        Ok(ctx) => ctx,
        Err(err) => return protocol::error_envelope(&err, meta),
    };
    // Seed the accumulator so events emitted by the handler carry the source
    // request's metadata.
    ctx.meta = meta;

    let Some((endpoint, method)) = envelope.action_tuple() else {
        return protocol::error_envelope(&ApiError::not_found("action"), ctx.meta);
    };

    match state.router.invoke(endpoint, method, &mut ctx).await {
        Ok(result) => protocol::success_envelope(result, ctx.meta),
        Err(err) => protocol::error_envelope(&err, ctx.meta),
    }
}

/// Push the connection greeting: the version payload with
/// `meta.event = "connection"`. Quota is peeked, not consumed.
async fn send_greeting(state: &Arc<AppState>, connection: &Arc<Connection>) {
    let identity = connection.identity();
    let key = RateKey::derive(identity.as_ref(), &connection.remote_addr);
    let status = state.limiter.peek(&key);

    let mut meta = Map::new();
    meta.insert(META_EVENT.to_string(), json!("connection"));
    protocol::merge_standard_meta(&mut meta, &status);

    let mut ctx = RequestContext {
        connection_id: Some(connection.id),
        remote_addr: connection.remote_addr.clone(),
        identity,
        scope: connection.scope(),
        ..RequestContext::default()
    };

    match state.router.invoke("version", "read", &mut ctx).await {
        Ok(result) => {
            if connection
                .send_json(&protocol::success_envelope(result, meta))
                .is_err()
            {
                debug!("Failed to push greeting to {}", connection.id);
            }
        }
        Err(err) => {
            warn!("Greeting route failed for {}: {:?}", connection.id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ScopePermissionEngine, StaticTokenResolver};
    use crate::handlers::register_builtin_routes;
    use crate::rate_limit::RateLimiterConfig;

    fn app_state(limit: u32) -> Arc<AppState> {
        let resolver: Arc<dyn AuthenticationResolver> =
            Arc::new(StaticTokenResolver::parse("tok=probe:user.read"));
        let registry = Arc::new(ConnectionRegistry::new(resolver.clone()));
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            authenticated_limit: limit,
            anonymous_limit: limit,
            window: Duration::from_secs(3600),
        }));
        let dispatcher = Arc::new(BroadcastDispatcher::new(
            registry.clone(),
            Arc::new(ScopePermissionEngine),
        ));
        let mut router = ActionRouter::new();
        register_builtin_routes(&mut router, registry.clone()).unwrap();
        Arc::new(AppState {
            registry,
            router: Arc::new(router),
            limiter,
            dispatcher,
            resolver,
        })
    }

    fn open(state: &Arc<AppState>) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
        let connection = state.registry.register(tx, "203.0.113.5".to_string());
        (connection, rx)
    }

    fn envelope(raw: &str) -> RequestEnvelope {
        serde_json::from_str(raw).unwrap()
    }

    #[tokio::test]
    async fn pipeline_returns_result_with_standard_meta() {
        let state = app_state(10);
        let (connection, _rx) = open(&state);

        let response = process_envelope(
            &state,
            &connection,
            envelope(r#"{"action": ["version", "read"], "meta": {"seq": 3}}"#),
        )
        .await;

        assert_eq!(response["result"]["version"], json!(env!("CARGO_PKG_VERSION")));
        assert_eq!(response["meta"]["seq"], json!(3));
        assert_eq!(response["meta"]["API-Version"], json!("2.0"));
        assert_eq!(response["meta"]["Rate-Limit-Limit"], json!(10));
        assert_eq!(response["meta"]["Rate-Limit-Remaining"], json!(9));
    }

    #[tokio::test]
    async fn unknown_action_yields_not_found_with_meta() {
        let state = app_state(10);
        let (connection, _rx) = open(&state);

        let response = process_envelope(
            &state,
            &connection,
            envelope(r#"{"action": ["nowhere", "read"]}"#),
        )
        .await;

        assert_eq!(response["errors"][0]["code"], json!("not_found"));
        assert_eq!(response["meta"]["API-Version"], json!("2.0"));
    }

    #[tokio::test]
    async fn missing_action_yields_not_found() {
        let state = app_state(10);
        let (connection, _rx) = open(&state);

        let response =
            process_envelope(&state, &connection, envelope(r#"{"data": {}}"#)).await;
        assert_eq!(response["errors"][0]["code"], json!("not_found"));
    }

    #[tokio::test]
    async fn exceeded_quota_short_circuits_the_handler() {
        let state = app_state(1);
        let (connection, _rx) = open(&state);

        let ok =
            process_envelope(&state, &connection, envelope(r#"{"action": ["version", "read"]}"#))
                .await;
        assert!(ok.get("result").is_some());

        let limited =
            process_envelope(&state, &connection, envelope(r#"{"action": ["version", "read"]}"#))
                .await;
        assert_eq!(limited["errors"][0]["code"], json!("rate_limit_exceeded"));
        assert_eq!(limited["meta"]["Rate-Limit-Remaining"], json!(0));
    }

    #[tokio::test]
    async fn param_collision_yields_client_error() {
        let state = app_state(10);
        let (connection, _rx) = open(&state);

        let response = process_envelope(
            &state,
            &connection,
            envelope(r#"{"action": ["version", "read"], "a": 1, "a.b": 2}"#),
        )
        .await;
        assert_eq!(response["errors"][0]["code"], json!("bad_request"));
    }

    #[tokio::test]
    async fn greeting_carries_the_connection_event_and_spares_quota() {
        let state = app_state(5);
        let (connection, mut rx) = open(&state);

        send_greeting(&state, &connection).await;

        let frame = rx.try_recv().unwrap();
        let Message::Text(text) = frame else {
            panic!("expected text frame");
        };
        let greeting: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(greeting["meta"]["event"], json!("connection"));
        assert_eq!(greeting["meta"]["Rate-Limit-Remaining"], json!(5));
        assert_eq!(greeting["result"]["version"], json!(env!("CARGO_PKG_VERSION")));

        // The greeting used peek: the first real request still sees the full
        // window.
        let response = process_envelope(
            &state,
            &connection,
            envelope(r#"{"action": ["version", "read"]}"#),
        )
        .await;
        assert_eq!(response["meta"]["Rate-Limit-Remaining"], json!(4));
    }

    #[tokio::test]
    async fn subscribe_action_feeds_topic_broadcasts() {
        let state = app_state(10);
        let (subscriber, mut rx_subscriber) = open(&state);
        let (_other, mut rx_other) = open(&state);

        let response = process_envelope(
            &state,
            &subscriber,
            envelope(r#"{"action": ["stream", "subscribe"], "id": "topic-1"}"#),
        )
        .await;
        assert_eq!(response["result"]["id"], json!("topic-1"));

        let source = RequestContext::default();
        state
            .dispatcher
            .broadcast_to_topic("topic-1", &source, json!({"seq": 1}));

        let frame = rx_subscriber.try_recv().unwrap();
        let Message::Text(text) = frame else {
            panic!("expected text frame");
        };
        let pushed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(pushed["result"]["seq"], json!(1));
        assert!(rx_other.try_recv().is_err());
    }
}
