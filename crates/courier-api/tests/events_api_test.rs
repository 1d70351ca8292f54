//! Event ingestion, delivery history and test deliveries over HTTP.

mod common;

use axum::http::{Method, StatusCode};
use common::TestApp;
use courier_core::{signing, WebhookSecret};
use serde_json::json;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn ingested_event_creates_one_pending_attempt_per_subscriber() {
    let app = TestApp::new();
    let hook = app.create_webhook("https://example.com/hook", &["payment.received"]).await;
    app.create_webhook("https://example.com/other", &["user.created"]).await;

    let (status, report) = app
        .call(
            Method::POST,
            "/events",
            Some(json!({"id": "evt_1", "type": "payment.received", "data": {"amount": 4200}})),
        )
        .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(report["event_id"], "evt_1");
    assert_eq!(report["first_seen"], true);
    assert_eq!(report["matched_webhooks"], 1);
    assert_eq!(report["attempts"].as_array().unwrap().len(), 1);

    let id = hook["id"].as_str().unwrap();
    let (status, page) = app.call(Method::GET, &format!("/webhooks/{id}/deliveries"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["status"], "pending");
    assert_eq!(page["items"][0]["attempt_number"], 1);
    assert_eq!(page["items"][0]["event_id"], "evt_1");
}

#[tokio::test]
async fn reposting_an_event_creates_nothing_new() {
    let app = TestApp::new();
    app.create_webhook("https://example.com/hook", &["user.created"]).await;
    let event = json!({"id": "evt_dup", "type": "user.created", "data": {}});

    let (_, first) = app.call(Method::POST, "/events", Some(event.clone())).await;
    let (status, second) = app.call(Method::POST, "/events", Some(event)).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["attempts"].as_array().unwrap().len(), 1);
    assert_eq!(second["first_seen"], false);
    assert!(second["attempts"].as_array().unwrap().is_empty());
    assert_eq!(app.store.all_attempts().await.len(), 1);
}

#[tokio::test]
async fn unknown_event_type_is_rejected() {
    let app = TestApp::new();

    let (status, body) = app
        .call(Method::POST, "/events", Some(json!({"id": "evt_2", "type": "order.shipped"})))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
    assert!(app.store.all_attempts().await.is_empty());
}

#[tokio::test]
async fn recorded_events_are_retrievable() {
    let app = TestApp::new();
    app.call(
        Method::POST,
        "/events",
        Some(json!({"id": "evt_stored", "type": "project.created", "data": {"name": "atlas"}})),
    )
    .await;

    let (status, event) = app.call(Method::GET, "/events/evt_stored", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(event["type"], "project.created");
    assert_eq!(event["data"]["name"], "atlas");
    let created_at: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(event["created_at"].clone()).unwrap();
    assert_eq!(created_at, app.clock_now());

    let (status, body) = app.call(Method::GET, "/events/evt_missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn delivery_listing_filters_by_status() {
    let app = TestApp::new();
    let hook = app.create_webhook("https://example.com/hook", &["user.created"]).await;
    let id = hook["id"].as_str().unwrap();
    app.call(Method::POST, "/events", Some(json!({"id": "evt_3", "type": "user.created"}))).await;

    let (_, pending) =
        app.call(Method::GET, &format!("/webhooks/{id}/deliveries?status=pending"), None).await;
    assert_eq!(pending["total"], 1);

    let (_, succeeded) =
        app.call(Method::GET, &format!("/webhooks/{id}/deliveries?status=success"), None).await;
    assert_eq!(succeeded["total"], 0);

    let (status, body) =
        app.call(Method::GET, &format!("/webhooks/{id}/deliveries?status=lost"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");

    let (status, _) = app
        .call(Method::GET, "/webhooks/00000000-0000-4000-8000-000000000000/deliveries", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn single_delivery_lookup() {
    let app = TestApp::new();
    app.create_webhook("https://example.com/hook", &["user.created"]).await;
    let (_, report) = app
        .call(Method::POST, "/events", Some(json!({"id": "evt_4", "type": "user.created"})))
        .await;
    let attempt_id = report["attempts"][0].as_str().unwrap();

    let (status, attempt) = app.call(Method::GET, &format!("/deliveries/{attempt_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(attempt["id"], attempt_id);
    assert_eq!(attempt["request_url"], "https://example.com/hook");

    let (status, _) = app
        .call(Method::GET, "/deliveries/00000000-0000-4000-8000-000000000000", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delivery_reports_success_with_verifiable_signature() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::header_exists("X-Webhook-Signature"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let app = TestApp::new();

    let (status, result) = app
        .call(
            Method::POST,
            "/webhooks/test",
            Some(json!({"url": format!("{}/probe", server.uri()), "event_type": "user.created"})),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "success");
    assert_eq!(result["response_code"], 204);

    let received = server.received_requests().await.expect("requests are recorded");
    let request = &received[0];
    let signature = request.headers.get("X-Webhook-Signature").unwrap().to_str().unwrap();
    let secret = WebhookSecret::new(result["signing_secret"].as_str().unwrap());
    assert!(signing::verify(signature, &request.body, &secret));

    // nothing is persisted by a probe
    assert!(app.store.all_attempts().await.is_empty());
}

#[tokio::test]
async fn test_delivery_reports_receiver_failure_in_body() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let app = TestApp::new();

    let (status, result) = app
        .call(
            Method::POST,
            "/webhooks/test",
            Some(json!({"url": server.uri(), "event_type": "payment.failed"})),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "failed");
    assert_eq!(result["response_code"], 500);
    assert_eq!(result["error_kind"], "receiver");
}

#[tokio::test]
async fn test_delivery_rejects_bad_input() {
    let app = TestApp::new();

    let (status, _) = app
        .call(
            Method::POST,
            "/webhooks/test",
            Some(json!({"url": "ftp://example.com", "event_type": "user.created"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .call(
            Method::POST,
            "/webhooks/test",
            Some(json!({"url": "https://example.com", "event_type": "nope"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
