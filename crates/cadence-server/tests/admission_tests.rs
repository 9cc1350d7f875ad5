mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use cadence_core::ratelimit::{LocalBucketStore, PolicySet, RateLimitPolicy};
use cadence_core::tasks::{HandlerRegistry, InMemoryTaskStore};
use cadence_core::testing::FailingBucketStore;
use cadence_server::api::middleware::{
    RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING, RATE_LIMIT_RESET, RATE_LIMIT_WINDOW,
};

use common::{get, send, setup, setup_with, test_policies};

const LIST: &str = "/v1/tasks?owner_id=alice";

#[tokio::test]
async fn test_allowed_requests_carry_headers() {
    let ctx = setup();

    let first = send(&ctx.router, get(LIST, "10.0.0.1")).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.header_u64(RATE_LIMIT_LIMIT), Some(2));
    assert_eq!(first.header_u64(RATE_LIMIT_REMAINING), Some(2));
    assert_eq!(first.header_u64(RATE_LIMIT_WINDOW), Some(60));
    // One token short of a full bucket at 2 tokens per 60 s
    assert_eq!(first.header_u64(RATE_LIMIT_RESET), Some(1_700_000_030));

    let second = send(&ctx.router, get(LIST, "10.0.0.1")).await;
    assert_eq!(second.header_u64(RATE_LIMIT_REMAINING), Some(1));
}

#[tokio::test]
async fn test_rejects_with_retry_after_once_exhausted() {
    let ctx = setup();

    // Capacity is 2 requests + 1 burst
    for _ in 0..3 {
        let response = send(&ctx.router, get(LIST, "10.0.0.1")).await;
        assert_eq!(response.status, StatusCode::OK);
    }

    let rejected = send(&ctx.router, get(LIST, "10.0.0.1")).await;
    assert_eq!(rejected.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rejected.header_u64("Retry-After"), Some(30));
    assert_eq!(rejected.header_u64(RATE_LIMIT_REMAINING), Some(0));
    assert_eq!(rejected.header_u64(RATE_LIMIT_LIMIT), Some(2));
    assert_eq!(rejected.body["error"], "Rate limit exceeded");
    assert_eq!(rejected.body["retry_after"], 30);
    assert!(rejected.body["message"].as_str().unwrap().contains("30 seconds"));
}

#[tokio::test]
async fn test_refill_admits_again() {
    let ctx = setup();

    for _ in 0..3 {
        send(&ctx.router, get(LIST, "10.0.0.1")).await;
    }
    assert_eq!(
        send(&ctx.router, get(LIST, "10.0.0.1")).await.status,
        StatusCode::TOO_MANY_REQUESTS
    );

    ctx.clock.advance(Duration::from_secs(30));
    let response = send(&ctx.router, get(LIST, "10.0.0.1")).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header_u64(RATE_LIMIT_REMAINING), Some(0));
}

#[tokio::test]
async fn test_clients_have_independent_budgets() {
    let ctx = setup();

    for _ in 0..3 {
        send(&ctx.router, get(LIST, "10.0.0.1")).await;
    }
    assert_eq!(
        send(&ctx.router, get(LIST, "10.0.0.1")).await.status,
        StatusCode::TOO_MANY_REQUESTS
    );

    // Only the first forwarded hop identifies the client
    let other = send(&ctx.router, get(LIST, "10.0.0.2, 10.0.0.1")).await;
    assert_eq!(other.status, StatusCode::OK);
}

#[tokio::test]
async fn test_path_groups_have_independent_budgets() {
    let policies = PolicySet::new(RateLimitPolicy::new(5, 60))
        .with_route("/v1/tasks/", RateLimitPolicy::new(1, 60));
    let ctx = setup_with(
        Arc::new(LocalBucketStore::new()),
        Arc::new(InMemoryTaskStore::new()),
        policies,
        HandlerRegistry::new(),
    );

    let first = send(&ctx.router, get("/v1/tasks/missing", "10.0.0.1")).await;
    assert_eq!(first.status, StatusCode::NOT_FOUND);
    assert_eq!(first.header_u64(RATE_LIMIT_LIMIT), Some(1));

    // Same group through the prefix match
    let same_group = send(&ctx.router, get("/v1/tasks/other", "10.0.0.1")).await;
    assert_eq!(same_group.status, StatusCode::TOO_MANY_REQUESTS);

    // The listing path does not match the pattern and uses the default group
    let default_group = send(&ctx.router, get(LIST, "10.0.0.1")).await;
    assert_eq!(default_group.status, StatusCode::OK);
    assert_eq!(default_group.header_u64(RATE_LIMIT_LIMIT), Some(5));
    assert_eq!(default_group.header_u64(RATE_LIMIT_REMAINING), Some(4));
}

#[tokio::test]
async fn test_exempt_paths_bypass_limits() {
    let policies = PolicySet::new(RateLimitPolicy::new(1, 60))
        .with_exempt("/")
        .with_exempt("/health");
    let ctx = setup_with(
        Arc::new(LocalBucketStore::new()),
        Arc::new(InMemoryTaskStore::new()),
        policies,
        HandlerRegistry::new(),
    );

    for _ in 0..5 {
        let health = send(&ctx.router, get("/health", "10.0.0.1")).await;
        assert_eq!(health.status, StatusCode::OK);
        assert!(health.header(RATE_LIMIT_LIMIT).is_none());

        let root = send(&ctx.router, get("/", "10.0.0.1")).await;
        assert_eq!(root.status, StatusCode::OK);
    }

    // "/" only exempts itself
    assert_eq!(send(&ctx.router, get(LIST, "10.0.0.1")).await.status, StatusCode::OK);
    assert_eq!(
        send(&ctx.router, get(LIST, "10.0.0.1")).await.status,
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_store_outage_fails_open() {
    let buckets = Arc::new(FailingBucketStore::new());
    let ctx = setup_with(
        buckets.clone(),
        Arc::new(InMemoryTaskStore::new()),
        test_policies(),
        HandlerRegistry::new(),
    );

    for _ in 0..10 {
        let response = send(&ctx.router, get(LIST, "10.0.0.1")).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.header_u64(RATE_LIMIT_REMAINING), Some(2));
    }
    assert_eq!(buckets.calls(), 10);
}

#[tokio::test]
async fn test_requests_without_identity_share_unknown_bucket() {
    let ctx = setup();
    let anonymous = || {
        axum::http::Request::builder()
            .uri(LIST)
            .body(axum::body::Body::empty())
            .unwrap()
    };

    for _ in 0..3 {
        assert_eq!(send(&ctx.router, anonymous()).await.status, StatusCode::OK);
    }
    assert_eq!(
        send(&ctx.router, anonymous()).await.status,
        StatusCode::TOO_MANY_REQUESTS
    );
}
