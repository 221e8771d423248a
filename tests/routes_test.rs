//! Ops API tests driven through the router without a listener.

mod helpers;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use helpers::*;
use std::time::Duration;
use tower::ServiceExt;

use tripdesk_jobs::app_state::AppState;
use tripdesk_jobs::models::admin::{FailedJobsResponse, JobActionResponse};
use tripdesk_jobs::routes::api_router;
use tripdesk_jobs::{Job, JobStatus, QueueStats};

async fn send(
    harness: &Harness,
    method: &str,
    uri: &str,
) -> (StatusCode, serde_json::Value) {
    let app = api_router(AppState {
        queue: harness.queue.clone(),
    });
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_stats_endpoint_reports_counts() {
    let h = Harness::new(Behavior::Succeed);
    h.enqueue(Duration::from_secs(60)).await;

    let (status, body) = send(&h, "GET", "/api/v1/jobs/stats").await;
    assert_eq!(status, StatusCode::OK);

    let stats: QueueStats = serde_json::from_value(body).unwrap();
    assert_eq!(stats.pending_count, 1);
    assert!(stats.store_reachable);
}

#[tokio::test]
async fn test_health_is_degraded_without_store() {
    let h = Harness::new(Behavior::Succeed);

    let (status, body) = send(&h, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    h.store.set_connected(false);
    let (status, body) = send(&h, "GET", "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["store"]["status"], "error");
}

#[tokio::test]
async fn test_get_job_returns_record_or_404() {
    let h = Harness::new(Behavior::Succeed);
    let id = h.enqueue(Duration::from_secs(60)).await;

    let (status, body) = send(&h, "GET", &format!("/api/v1/jobs/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    let job: Job = serde_json::from_value(body).unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Pending);

    let missing = uuid::Uuid::now_v7();
    let (status, _) = send(&h, "GET", &format!("/api/v1/jobs/{missing}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&h, "GET", "/api/v1/jobs/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_failed_listing_and_retry() {
    let h = Harness::new(Behavior::FailPermanently);
    let id = h.enqueue(Duration::ZERO).await;
    h.queue.tick().await;

    let (status, body) = send(&h, "GET", "/api/v1/jobs/failed?limit=10").await;
    assert_eq!(status, StatusCode::OK);
    let listing: FailedJobsResponse = serde_json::from_value(body).unwrap();
    assert_eq!(listing.count, 1);
    assert_eq!(listing.jobs[0].id, id);

    let (status, body) = send(&h, "POST", &format!("/api/v1/jobs/{id}/retry")).await;
    assert_eq!(status, StatusCode::OK);
    let response: JobActionResponse = serde_json::from_value(body).unwrap();
    assert!(response.accepted);

    let (status, _) = send(&h, "POST", &format!("/api/v1/jobs/{id}/retry")).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_cancel_endpoint() {
    let h = Harness::new(Behavior::Succeed);
    let id = h.enqueue(Duration::from_secs(600)).await;

    let (status, body) = send(&h, "POST", &format!("/api/v1/jobs/{id}/cancel")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);

    let (status, body) = send(&h, "POST", &format!("/api/v1/jobs/{id}/cancel")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["accepted"], false);
}
