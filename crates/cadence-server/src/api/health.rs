//! Service endpoints: health and service info

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ServerResult;
use crate::server::CadenceServer;

fn dependency_status(result: &ServerResult<bool>) -> &'static str {
    match result {
        Ok(true) => "UP",
        Ok(false) => "DEGRADED",
        Err(_) => "DOWN",
    }
}

/// Health check handler
///
/// Reports the state of the bucket and task stores along with queue occupancy.
/// Answers 503 when either store is down; a down bucket store still admits
/// traffic (fail open), so this is the only place the outage becomes visible.
pub async fn health_check(State(server): State<Arc<CadenceServer>>) -> impl IntoResponse {
    debug!("Health check requested");

    let bucket_health = server.check_bucket_store_health().await;
    if let Err(e) = &bucket_health {
        warn!("Bucket store health check failed: {}", e);
    }
    let bucket_status = dependency_status(&bucket_health);

    let task_health = server.check_task_store_health().await;
    if let Err(e) = &task_health {
        warn!("Task store health check failed: {}", e);
    }
    let task_status = dependency_status(&task_health);

    let queue = match server.queue_stats().await {
        Ok(stats) => json!(stats),
        Err(_) => serde_json::Value::Null,
    };

    let any_down = bucket_status == "DOWN" || task_status == "DOWN";
    let overall = if any_down || bucket_status == "DEGRADED" || task_status == "DEGRADED" {
        "DEGRADED"
    } else {
        "UP"
    };

    let response = json!({
        "status": overall,
        "version": env!("CARGO_PKG_VERSION"),
        "dependencies": {
            "bucketStore": {
                "backend": server.limiter().store().backend(),
                "status": bucket_status,
            },
            "taskStore": {
                "backend": server.tasks().backend(),
                "status": task_status,
            },
        },
        "queue": queue,
    });

    let status = if any_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status, Json(response))
}

/// Service info handler
pub async fn service_info(State(server): State<Arc<CadenceServer>>) -> impl IntoResponse {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "handlers": server.registry().names(),
    }))
}
