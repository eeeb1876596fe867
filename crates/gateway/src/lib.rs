//! Real-time event gateway in front of a request/response API.
//!
//! The gateway:
//! - Accepts persistent WebSocket connections and authenticates them
//! - Routes inbound action requests to the same handlers the synchronous
//!   API uses
//! - Enforces per-identity request quotas in fixed windows
//! - Fans state-change events out to the subset of connections that are
//!   both subscribed and permitted to see them
//!
//! ## Architecture
//!
//! ```text
//! WebSocket / HTTP front
//!         ↓
//! RateLimiter (per-key fixed windows)
//!         ↓
//! ActionRouter (one instance, both transports)
//!         ↓
//! handlers → BroadcastDispatcher
//!         ↓
//! ConnectionRegistry (DashMap-based, snapshot fan-out)
//! ```
//!
//! ## Isolation
//!
//! - Per-connection tasks; nothing blocks across connections
//! - Broadcasts run over point-in-time registry snapshots
//! - A dead recipient is logged and skipped, never fatal to a fan-out

pub mod auth;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod http_server;
pub mod protocol;
pub mod rate_limit;
pub mod router;
pub mod ws_server;

pub use auth::{ScopePermissionEngine, StaticTokenResolver};
pub use connection::{Connection, ConnectionId, ConnectionRegistry};
pub use context::RequestContext;
pub use dispatch::{BroadcastDispatcher, Event};
pub use error::{GatewayError, Result};
pub use protocol::RequestEnvelope;
pub use rate_limit::{RateKey, RateLimitStatus, RateLimiter, RateLimiterConfig};
pub use router::{ActionHandler, ActionRouter};
pub use ws_server::AppState;
