//! Integration tests for the `/api/v1/jobs` endpoints.

mod common;

use assert_matches::assert_matches;
use axum::http::StatusCode;
use common::{body_json, build_test_app, get, post_json, test_service};
use serde_json::json;

// ---------------------------------------------------------------------------
// Test: POST /api/v1/jobs enqueues and returns 201
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_job_returns_created_job() {
    let service = test_service();
    let app = build_test_app(service.clone());

    let response = post_json(
        app,
        "/api/v1/jobs",
        json!({ "parameters": { "width": 1024, "steps": 40, "prompt": "a red fox" } }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = body_json(response).await;
    let job = &json["data"];
    assert!(job["id"].as_str().is_some_and(|id| !id.is_empty()));
    assert_eq!(job["attempt"], 1);
    assert_eq!(job["parameters"]["width"], 1024);
    assert_eq!(job["parameters"]["prompt"], "a red fox");
    assert_matches!(job["state"].as_str(), Some("queued" | "submitting" | "polling"));

    service.shutdown().await;
}

#[tokio::test]
async fn submit_with_caller_id_and_fetch_it() {
    let service = test_service();

    let response = post_json(
        build_test_app(service.clone()),
        "/api/v1/jobs",
        json!({ "id": "render-42", "parameters": { "seed": 7 } }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = get(build_test_app(service.clone()), "/api/v1/jobs/render-42").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["id"], "render-42");
    assert_eq!(json["data"]["parameters"]["seed"], 7);

    service.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: intake errors map to JSON error bodies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_id_returns_409() {
    let service = test_service();
    let body = json!({ "id": "dup", "parameters": {} });

    post_json(build_test_app(service.clone()), "/api/v1/jobs", body.clone()).await;
    let response = post_json(build_test_app(service.clone()), "/api/v1/jobs", body).await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_json(response).await;
    assert_eq!(json["code"], "CONFLICT");

    service.shutdown().await;
}

#[tokio::test]
async fn blank_id_returns_400() {
    let service = test_service();
    let response = post_json(
        build_test_app(service.clone()),
        "/api/v1/jobs",
        json!({ "id": "  ", "parameters": {} }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "BAD_REQUEST");
    service.shutdown().await;
}

#[tokio::test]
async fn invalid_parameters_return_validation_error() {
    let service = test_service();
    let response = post_json(
        build_test_app(service.clone()),
        "/api/v1/jobs",
        json!({ "parameters": { "": 1 } }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert!(json["error"].as_str().unwrap().contains("must not be empty"));

    service.shutdown().await;
}

#[tokio::test]
async fn missing_parameters_is_rejected() {
    let service = test_service();
    let response = post_json(build_test_app(service.clone()), "/api/v1/jobs", json!({})).await;

    assert!(response.status().is_client_error());
    service.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: lookups and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_job_returns_404() {
    let service = test_service();
    let response = get(build_test_app(service.clone()), "/api/v1/jobs/missing").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");
    assert_eq!(json["error"], "job with id missing not found");

    service.shutdown().await;
}

#[tokio::test]
async fn cancelling_queued_job_returns_cancelled() {
    let service = test_service();
    for id in ["first", "second", "third"] {
        post_json(
            build_test_app(service.clone()),
            "/api/v1/jobs",
            json!({ "id": id, "parameters": {} }),
        )
        .await;
    }

    // One worker is stuck on "first", so "third" is still queued.
    let response = post_json(build_test_app(service.clone()), "/api/v1/jobs/third/cancel", json!({})).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["data"]["state"], "cancelled");
    assert!(json["data"]["completed_at"].is_string());

    let response = get(build_test_app(service.clone()), "/api/v1/jobs/third").await;
    assert_eq!(body_json(response).await["data"]["state"], "cancelled");

    service.shutdown().await;
}

#[tokio::test]
async fn cancelling_unknown_job_returns_404() {
    let service = test_service();
    let response = post_json(build_test_app(service.clone()), "/api/v1/jobs/nope/cancel", json!({})).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    service.shutdown().await;
}
