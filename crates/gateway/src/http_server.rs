//! Request/response front.
//!
//! A thin HTTP surface over the same action pipeline the persistent front
//! uses: one router instance, one rate limiter, one error taxonomy.
//! Resource controller business logic lives behind the registered handlers,
//! not here.

use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use common::{ApiError, Identity};
use metrics::counter;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use crate::context::{originating_address, RequestContext};
use crate::protocol::{self, RequestEnvelope, API_VERSION};
use crate::rate_limit::{RateKey, RateLimitStatus};
use crate::ws_server::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api", post(action_handler))
        .with_state(state)
}

async fn action_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    Json(envelope): Json<RequestEnvelope>,
) -> Response {
    counter!("gateway_requests_total").increment(1);

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok());
    let remote_addr = originating_address(forwarded, &peer.to_string());

    // Caller meta first; gateway keys never overwrite it.
    let mut meta = envelope.meta.clone();

    // A missing credential means anonymous. An explicit invalid one is an
    // authentication error.
    let (identity, scope) = match authenticate(&state, &headers).await {
        Ok(pair) => pair,
        Err(err) => return respond(&err, protocol::error_envelope(&err, meta), None),
    };

    let key = RateKey::derive(identity.as_ref(), &remote_addr);
    let status = state.limiter.check(&key);
    protocol::merge_standard_meta(&mut meta, &status);

    info!(
        "Request by {} for {:?} (remaining {})",
        remote_addr,
        envelope.action_tuple(),
        status.remaining
    );
    if envelope.data.is_some() {
        tracing::debug!("Request payload: {}", censor(envelope.data.as_ref()));
    }

    if status.exceeded {
        counter!("gateway_rate_limited_total").increment(1);
        let err = ApiError::RateLimit;
        return respond(&err, protocol::error_envelope(&err, meta), Some(&status));
    }

    let mut ctx = match RequestContext::new(None, remote_addr, identity, scope, &envelope) {
        Ok(ctx) => ctx,
        Err(err) => return respond(&err, protocol::error_envelope(&err, meta), Some(&status)),
    };
    ctx.meta = meta;

    let Some((endpoint, method)) = envelope.action_tuple() else {
        let err = ApiError::not_found("action");
        return respond(&err, protocol::error_envelope(&err, ctx.meta), Some(&status));
    };

    match state.router.invoke(endpoint, method, &mut ctx).await {
        Ok(result) => {
            let body = protocol::success_envelope(result, ctx.meta);
            with_standard_headers((StatusCode::OK, Json(body)).into_response(), Some(&status))
        }
        Err(err) => respond(&err, protocol::error_envelope(&err, ctx.meta), Some(&status)),
    }
}

/// Resolve the Authorization header, if any.
async fn authenticate(
    state: &Arc<AppState>,
    headers: &axum::http::HeaderMap,
) -> Result<(Option<Identity>, Vec<String>), ApiError> {
    let Some(token) = bearer_token(headers) else {
        return Ok((None, Vec::new()));
    };

    match state.resolver.bearer_authenticate(token).await {
        Ok(auth) => match auth.identity {
            Some(identity) => Ok((Some(identity), auth.scope)),
            None => Err(ApiError::auth("invalid bearer token")),
        },
        Err(err) => {
            error!("Bearer resolution failed: {:?}", err);
            Err(ApiError::Internal)
        }
    }
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Replace commonly sensitive fields before the payload reaches a log line.
fn censor(data: Option<&Value>) -> Value {
    match data {
        Some(Value::Object(map)) => {
            let mut censored = map.clone();
            for field in ["password", "secret"] {
                if censored.contains_key(field) {
                    censored.insert(field.to_string(), json!("[CENSORED]"));
                }
            }
            Value::Object(censored)
        }
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

fn respond(err: &ApiError, body: Value, rate: Option<&RateLimitStatus>) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    with_standard_headers((status, Json(body)).into_response(), rate)
}

fn with_standard_headers(mut response: Response, rate: Option<&RateLimitStatus>) -> Response {
    let headers = response.headers_mut();
    headers.insert("X-API-Version", HeaderValue::from_static(API_VERSION));
    if let Some(rate) = rate {
        headers.insert("X-Rate-Limit-Limit", HeaderValue::from(rate.total));
        headers.insert("X-Rate-Limit-Remaining", HeaderValue::from(rate.remaining));
        headers.insert("X-Rate-Limit-Reset", HeaderValue::from(rate.next_reset));
    }
    response
}
