//! Admission middleware
//!
//! Every non-exempt request is charged one token from the bucket of
//! `{client}:{path group}`. Admitted requests carry the `X-RateLimit-*` headers
//! on their response; rejected ones get a 429 with `Retry-After`.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use cadence_core::ratelimit::Admission;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::server::CadenceServer;

pub const RATE_LIMIT_LIMIT: &str = "X-RateLimit-Limit";
pub const RATE_LIMIT_REMAINING: &str = "X-RateLimit-Remaining";
pub const RATE_LIMIT_RESET: &str = "X-RateLimit-Reset";
pub const RATE_LIMIT_WINDOW: &str = "X-RateLimit-Window";

const FORWARDED_FOR: &str = "X-Forwarded-For";
const REAL_IP: &str = "X-Real-IP";

/// Identity used when nothing else identifies the client
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Identify the client: first forwarded hop, then the real-ip header, then the
/// peer address
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(FORWARDED_FOR)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get(REAL_IP)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Add rate limiting headers to a response
fn add_rate_limit_headers(headers: &mut HeaderMap, admission: &Admission) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(admission.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(admission.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(admission.reset_at_secs()));
    headers.insert(RATE_LIMIT_WINDOW, HeaderValue::from(admission.window_secs));
}

fn too_many_requests(admission: &Admission) -> Response {
    let retry_after = admission.retry_after_secs();
    let body = Json(json!({
        "error": "Rate limit exceeded",
        "message": format!(
            "Too many requests: {} per {} seconds allowed. Try again in {} seconds.",
            admission.limit, admission.window_secs, retry_after
        ),
        "retry_after": retry_after,
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    let headers = response.headers_mut();
    add_rate_limit_headers(headers, admission);
    headers.insert("Retry-After", HeaderValue::from(retry_after));
    response
}

/// Rate limit middleware, installed with `axum::middleware::from_fn_with_state`
pub async fn rate_limit(State(server): State<Arc<CadenceServer>>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    let policies = server.policies();

    if policies.is_exempt(path) {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identity(request.headers(), peer);

    let matched = policies.lookup(path);
    let key = format!("{}:{}", client, matched.group);
    let policy = *matched.policy;

    let admission = server.limiter().admit(&key, &policy).await;

    if !admission.allowed {
        debug!(key = %key, "Rejecting request, retry after {}s", admission.retry_after_secs());
        return too_many_requests(&admission);
    }

    let mut response = next.run(request).await;
    add_rate_limit_headers(response.headers_mut(), &admission);
    response
}
