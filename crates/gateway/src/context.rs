//! Per-message request context construction.
//!
//! A context is built from a connection (or HTTP request) plus an inbound
//! envelope, and is the only value handlers ever see: originating address,
//! identity snapshot, decoded parameters, payload, and the response
//! metadata accumulator.

use common::{ApiError, Identity};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::protocol::{RequestEnvelope, RESERVED_KEYS};

/// Per-message value carrying identity, parameters, and metadata into a
/// handler.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Source connection, absent for contexts built by the HTTP front.
    pub connection_id: Option<Uuid>,
    /// Forwarded-header value when present, else the transport peer address.
    pub remote_addr: String,
    /// Identity snapshot taken at context construction; never re-resolved.
    pub identity: Option<Identity>,
    /// Permission scopes granted to the identity, empty if anonymous.
    pub scope: Vec<String>,
    /// Merged parameters with dot-keys decoded into nested objects.
    pub params: Map<String, Value>,
    /// Request payload.
    pub data: Option<Value>,
    /// Response metadata accumulator; handlers may add entries.
    pub meta: Map<String, Value>,
}

impl RequestContext {
    /// Build a context from an inbound envelope.
    ///
    /// Fails with a client error when a dot-delimited parameter key collides
    /// with an existing non-object value.
    pub fn new(
        connection_id: Option<Uuid>,
        remote_addr: impl Into<String>,
        identity: Option<Identity>,
        scope: Vec<String>,
        envelope: &RequestEnvelope,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            connection_id,
            remote_addr: remote_addr.into(),
            identity,
            scope,
            params: decode_params(&envelope.params)?,
            data: envelope.data.clone(),
            meta: Map::new(),
        })
    }

    /// Fetch a string parameter by top-level key.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Decode a flat parameter map into a nested one.
///
/// A key `"foo.bar"` with value `v` becomes `{foo: {bar: v}}`. Keys whose
/// first segment is reserved (`data`, `meta`, `action`) are stripped so
/// parameters can never shadow handler arguments. A segment that collides
/// with an existing non-object value is rejected.
pub fn decode_params(flat: &Map<String, Value>) -> Result<Map<String, Value>, ApiError> {
    let mut root = Map::new();

    for (key, value) in flat {
        let segments: Vec<&str> = key.split('.').collect();
        if RESERVED_KEYS.contains(&segments[0]) {
            continue;
        }

        let mut cursor = &mut root;
        for (index, segment) in segments.iter().enumerate() {
            if index == segments.len() - 1 {
                cursor.insert((*segment).to_string(), value.clone());
            } else {
                let slot = cursor
                    .entry((*segment).to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                match slot {
                    Value::Object(map) => cursor = map,
                    _ => {
                        return Err(ApiError::client(format!(
                            "parameter key '{key}' collides with a non-object value"
                        )))
                    }
                }
            }
        }
    }

    Ok(root)
}

/// Derive the originating address: first entry of the forwarded-for header
/// when present, else the transport-level peer address.
pub fn originating_address(forwarded_for: Option<&str>, peer_addr: &str) -> String {
    forwarded_for
        .and_then(|header| header.split(',').next())
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .unwrap_or_else(|| peer_addr.to_string())
}
