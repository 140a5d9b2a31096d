//! HTTP API integration tests

mod helpers;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use docket_common::messages::INTAKE_QUEUE;
use docket_pipeline::AppState;
use helpers::{RecordingScorer, TestEnv, TARGET};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

const BOUNDARY: &str = "docket-test-boundary";

fn app(env: &TestEnv) -> Router {
    let state = AppState::new(
        env.coordinator.clone(),
        env.migration.clone(),
        env.broker.clone(),
        env.events.clone(),
    );
    docket_pipeline::build_router(state)
}

fn multipart_body(fields: &[(&str, &str)], files: &[(&str, &str)]) -> Vec<u8> {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
            BOUNDARY, name, value
        ));
    }
    for (filename, content) in files {
        body.push_str(&format!(
            "--{}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n{}\r\n",
            BOUNDARY, filename, content
        ));
    }
    body.push_str(&format!("--{}--\r\n", BOUNDARY));
    body.into_bytes()
}

fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", format!("multipart/form-data; boundary={}", BOUNDARY))
        .body(Body::from(body))
        .unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let env = TestEnv::new().await;
    let response = app(&env).oneshot(empty_request("GET", "/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "docket");
    assert_eq!(json["queues"][INTAKE_QUEUE], 0);
}

#[tokio::test]
async fn test_ledger_endpoints() {
    let env = TestEnv::new().await;
    let app = app(&env);

    let create = json!({"job_id": "job-api-1", "target_text": TARGET, "expected_count": 2});
    let response = app.clone().oneshot(json_request("POST", "/jobs", create.clone())).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["status"], "pending");
    assert_eq!(json["expected_files"], 2);

    let response = app.clone().oneshot(json_request("POST", "/jobs", create)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .clone()
        .oneshot(json_request("PATCH", "/jobs/job-api-1/expected", json!({"delta": 3})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["expected_files"], 5);
    assert_eq!(json["first_index"], 2);

    let response = app.clone().oneshot(empty_request("GET", "/jobs/job-api-1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["store"], "pending");
    assert_eq!(json["job_id"], "job-api-1");

    let response = app
        .clone()
        .oneshot(json_request("PATCH", "/jobs/job-api-1/status", json!({"status": "archived"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .clone()
        .oneshot(json_request("PATCH", "/jobs/job-api-1/status", json!({"status": "finished"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Nothing recorded yet, so the job cannot be declared complete
    let response = app
        .clone()
        .oneshot(json_request("PATCH", "/jobs/job-api-1/status", json!({"status": "complete"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app.clone().oneshot(empty_request("POST", "/jobs/job-api-1/sync")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app.clone().oneshot(empty_request("DELETE", "/jobs/job-api-1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.oneshot(empty_request("DELETE", "/jobs/job-api-1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_invalid_job_id_is_rejected() {
    let env = TestEnv::new().await;
    let create = json!({"job_id": "../etc", "target_text": TARGET, "expected_count": 1});
    let response = app(&env).oneshot(json_request("POST", "/jobs", create)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_submit_process_sync_and_query() {
    let env = TestEnv::new().await;
    let app = app(&env);

    let body = multipart_body(
        &[("target_text", TARGET), ("use_rate_limit", "false")],
        &[("alice.txt", "Rust and Tokio"), ("bob.txt", "Python"), ("notes.exe", "MZ")],
    );
    let response = app.clone().oneshot(multipart_request("/jobs/submit", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["status"], "accepted");
    assert_eq!(json["file_count"], 2);
    assert_eq!(json["skipped_count"], 1);
    assert_eq!(json["skipped_files"][0]["filename"], "notes.exe");
    let job_id = json["job_id"].as_str().unwrap().to_string();

    let scorer = RecordingScorer::with_scores(&[("alice.txt", 88), ("bob.txt", 40)]);
    env.drain(Arc::new(scorer)).await;

    let response = app.clone().oneshot(empty_request("GET", &format!("/jobs/{}", job_id))).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["status"], "complete");

    let response = app
        .clone()
        .oneshot(empty_request("POST", &format!("/jobs/{}/sync", job_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["migrated"], 2);
    assert_eq!(json["total"], 2);

    let response = app
        .clone()
        .oneshot(empty_request("GET", &format!("/jobs/{}/results", job_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total"], 2);
    assert_eq!(json["items"][0]["display_name"], "alice.txt");
    assert_eq!(json["items"][0]["payload"]["match_score"], 88);
    let bob_id = json["items"][1]["item_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(empty_request("DELETE", &format!("/jobs/{}/items/{}", job_id, bob_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total"], 1);

    let response = app.oneshot(empty_request("GET", &format!("/jobs/{}", job_id))).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["store"], "archived");
    assert_eq!(json["total"], 1);
}

#[tokio::test]
async fn test_submit_without_valid_files_is_bad_request() {
    let env = TestEnv::new().await;
    let body = multipart_body(&[("target_text", TARGET)], &[("image.png", "PNG")]);
    let response = app(&env).oneshot(multipart_request("/jobs/submit", body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(env.staged_job_count(), 0);
}

#[tokio::test]
async fn test_submit_without_target_text_is_bad_request() {
    let env = TestEnv::new().await;
    let body = multipart_body(&[], &[("cv.txt", "Rust")]);
    let response = app(&env).oneshot(multipart_request("/jobs/submit", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_broker_outage_is_service_unavailable() {
    let env = TestEnv::new().await;
    env.broker.fail_publishes_to(INTAKE_QUEUE);

    let body = multipart_body(&[("target_text", TARGET)], &[("cv.txt", "Rust")]);
    let response = app(&env).oneshot(multipart_request("/jobs/submit", body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "SERVICE_UNAVAILABLE");
    assert_eq!(env.staged_job_count(), 0);
}

#[tokio::test]
async fn test_add_items_endpoint() {
    let env = TestEnv::new().await;
    let app = app(&env);

    let body = multipart_body(&[("target_text", TARGET)], &[("a.txt", "one")]);
    let response = app.clone().oneshot(multipart_request("/jobs/submit", body)).await.unwrap();
    let job_id = body_json(response).await["job_id"].as_str().unwrap().to_string();

    let body = multipart_body(&[], &[("b.txt", "two")]);
    let response = app
        .clone()
        .oneshot(multipart_request(&format!("/jobs/{}/items", job_id), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["added"], 1);
    assert_eq!(json["expected_files"], 2);
    assert_eq!(json["resumed"], false);

    let body = multipart_body(&[], &[("c.txt", "three")]);
    let response = app
        .oneshot(multipart_request("/jobs/unknown-job/items", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
