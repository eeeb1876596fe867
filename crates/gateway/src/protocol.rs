//! Wire envelope types shared by the persistent and request/response fronts.
//!
//! Inbound: `{ action: [endpoint, method], data, meta, ...params }`.
//! Outbound success: `{ result, meta }`; outbound error: `{ errors, meta }`.
//! Event pushes are success envelopes with `meta.event` set.

use common::ApiError;
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Protocol version advertised in every response.
pub const API_VERSION: &str = "2.0";

pub const META_API_VERSION: &str = "API-Version";
pub const META_RATE_LIMIT_LIMIT: &str = "Rate-Limit-Limit";
pub const META_RATE_LIMIT_REMAINING: &str = "Rate-Limit-Remaining";
pub const META_RATE_LIMIT_RESET: &str = "Rate-Limit-Reset";
pub const META_EVENT: &str = "event";

/// Reserved top-level envelope keys, never exposed as handler parameters.
pub const RESERVED_KEYS: [&str; 3] = ["data", "meta", "action"];

/// Inbound request envelope.
///
/// Any top-level key other than the reserved three lands in `params` and is
/// decoded into the nested parameter namespace during context construction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestEnvelope {
    /// `[endpoint, method]` routing tuple.
    #[serde(default)]
    pub action: Option<Vec<Value>>,
    /// Request payload.
    #[serde(default)]
    pub data: Option<Value>,
    /// Caller-supplied metadata, echoed back with gateway keys merged in.
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Remaining top-level keys: the flat parameter namespace.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl RequestEnvelope {
    /// Extract the routing tuple when it is exactly two strings.
    ///
    /// Anything else (missing, wrong arity, non-string elements) resolves no
    /// handler and surfaces as NotFound downstream.
    pub fn action_tuple(&self) -> Option<(&str, &str)> {
        match self.action.as_deref() {
            Some([endpoint, method]) => match (endpoint.as_str(), method.as_str()) {
                (Some(e), Some(m)) => Some((e, m)),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Build a success envelope.
pub fn success_envelope(result: Value, meta: Map<String, Value>) -> Value {
    json!({ "result": result, "meta": meta })
}

/// Build an error envelope.
pub fn error_envelope(error: &ApiError, meta: Map<String, Value>) -> Value {
    json!({ "errors": [error.to_wire()], "meta": meta })
}

/// Insert `value` under `key` unless the caller already supplied that key.
///
/// Merge is caller-meta-first: gateway keys never silently overwrite
/// caller-supplied metadata.
pub fn merge_missing(meta: &mut Map<String, Value>, key: &str, value: Value) {
    meta.entry(key.to_string()).or_insert(value);
}

/// Merge the gateway's standard response metadata: protocol version plus the
/// rate-limit counters valid for the source request.
pub fn merge_standard_meta(meta: &mut Map<String, Value>, rate: &crate::rate_limit::RateLimitStatus) {
    merge_missing(meta, META_API_VERSION, json!(API_VERSION));
    merge_missing(meta, META_RATE_LIMIT_LIMIT, json!(rate.total));
    merge_missing(meta, META_RATE_LIMIT_REMAINING, json!(rate.remaining));
    merge_missing(meta, META_RATE_LIMIT_RESET, json!(rate.next_reset));
}
