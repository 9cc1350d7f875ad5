#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use cadence_core::ratelimit::{BucketStore, LocalBucketStore, PolicySet, RateLimitPolicy, RateLimiter};
use cadence_core::tasks::{HandlerRegistry, InMemoryTaskStore, TaskStore};
use cadence_core::ManualClock;
use cadence_server::api::build_router;
use cadence_server::{CadenceServer, ServerConfig};

pub struct TestContext {
    pub server: Arc<CadenceServer>,
    pub router: Router,
    pub clock: Arc<ManualClock>,
}

pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn header_u64(&self, name: &str) -> Option<u64> {
        self.header(name).and_then(|v| v.parse().ok())
    }
}

/// Policies used by most tests: a tight task API budget and a default one
pub fn test_policies() -> PolicySet {
    PolicySet::new(RateLimitPolicy::new(5, 60))
        .with_route("/v1/tasks", RateLimitPolicy::new(2, 60).with_burst(1))
        .with_exempt("/")
        .with_exempt("/health")
}

pub fn setup_with(
    buckets: Arc<dyn BucketStore>,
    tasks: Arc<dyn TaskStore>,
    policies: PolicySet,
    registry: HandlerRegistry,
) -> TestContext {
    let clock = Arc::new(ManualClock::default());
    let limiter = Arc::new(RateLimiter::with_clock(buckets, clock.clone()));
    let server = Arc::new(CadenceServer::new(
        ServerConfig::default(),
        limiter,
        policies,
        tasks,
        Arc::new(registry),
    ));
    let router = build_router(Arc::clone(&server));

    TestContext { server, router, clock }
}

pub fn setup() -> TestContext {
    setup_with(
        Arc::new(LocalBucketStore::new()),
        Arc::new(InMemoryTaskStore::new()),
        test_policies(),
        HandlerRegistry::new(),
    )
}

pub async fn send(router: &Router, request: Request<Body>) -> Response {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };

    Response { status, headers, body }
}

pub fn get(uri: &str, client: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("X-Forwarded-For", client)
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(uri: &str, client: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("X-Forwarded-For", client)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
