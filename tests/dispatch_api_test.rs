//! HTTP API behavior: dispatch trigger, job inspection, cancellation.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Timelike, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use adsync::api::{create_sync_router, SyncAppState};
use adsync::claims::ClaimLedger;
use adsync::config::SyncConfig;
use adsync::cron::CronWindowRegistry;
use adsync::cursor::SyncCursorStore;
use adsync::dispatch::Dispatcher;
use adsync::jobs::{CrawlJob, CrawlJobStore, JobType};

struct TestApi {
    router: Router,
    jobs: Arc<CrawlJobStore>,
}

fn test_api() -> TestApi {
    let claims = Arc::new(ClaimLedger::in_memory(5, Duration::from_secs(3600)).unwrap());
    let jobs = Arc::new(CrawlJobStore::in_memory().unwrap());
    let cursors = Arc::new(SyncCursorStore::in_memory().unwrap());
    let cron = Arc::new(CronWindowRegistry::in_memory().unwrap());

    // One claimed account with an insight window open at the current hour
    claims.claim("op-1", "act_1").unwrap();
    let hour = Utc::now().hour() as u8;
    cron.upsert_window("op-1", JobType::InsightSync, &[hour], true)
        .unwrap();

    let dispatcher = Dispatcher::new(
        claims,
        Arc::clone(&jobs),
        cursors,
        cron,
        SyncConfig::default(),
    );
    let state = Arc::new(SyncAppState {
        dispatcher,
        jobs: Arc::clone(&jobs),
    });
    TestApi {
        router: create_sync_router(state),
        jobs,
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_endpoint_is_up() {
    let api = test_api();
    let response = api.router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn dispatch_creates_insight_job() {
    let api = test_api();
    let response = api
        .router
        .clone()
        .oneshot(post_json(
            "/api/dispatch",
            json!({
                "job_types": ["insight-sync"],
                "date_start": "2024-01-01",
                "date_end": "2024-01-07"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let created = body["created"].as_array().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(body["skipped"], 0);

    // The created job is inspectable
    let job_id = created[0].as_str().unwrap();
    let response = api
        .router
        .oneshot(get(&format!("/api/jobs/{job_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let job = body_json(response).await;
    assert_eq!(job["state"], "pending");
    assert_eq!(job["job_type"], "insight-sync");
    assert_eq!(job["account_id"], "act_1");
}

#[tokio::test]
async fn dispatch_reports_aggregate_skipped_count() {
    let api = test_api();
    // No campaign-sync window is configured, so the one claimed account skips
    let response = api
        .router
        .oneshot(post_json(
            "/api/dispatch",
            json!({"job_types": ["campaign-sync"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert!(body["created"].as_array().unwrap().is_empty());
    assert_eq!(body["skipped"], 1);
    assert_eq!(body["skipped_window_closed"], 1);
}

#[tokio::test]
async fn inverted_date_range_is_bad_request() {
    let api = test_api();
    let response = api
        .router
        .oneshot(post_json(
            "/api/dispatch",
            json!({
                "job_types": ["insight-sync"],
                "date_start": "2024-01-07",
                "date_end": "2024-01-01"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("precedes"));
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let api = test_api();
    let response = api
        .router
        .clone()
        .oneshot(get(&format!("/api/jobs/{}", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Malformed ids are rejected outright
    let response = api
        .router
        .oneshot(get("/api/jobs/not-a-uuid"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_flags_a_pending_job() {
    let api = test_api();
    let job = CrawlJob::new("op-1", "act_1", JobType::CampaignSync);
    api.jobs.create(&job).unwrap();

    let response = api
        .router
        .clone()
        .oneshot(post_json(
            &format!("/api/jobs/{}/cancel", job.id),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(api.jobs.cancel_requested(job.id).unwrap());

    // Cancelling an unknown job reports 404
    let response = api
        .router
        .oneshot(post_json(
            &format!("/api/jobs/{}/cancel", Uuid::new_v4()),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
