//! Webhook management endpoints: registration, CRUD and security settings.

mod common;

use axum::http::{Method, StatusCode};
use common::TestApp;
use serde_json::json;

#[tokio::test]
async fn registration_returns_secret_exactly_once() {
    let app = TestApp::new();

    let created = app.create_webhook("https://example.com/hook", &["payment.received"]).await;
    let id = created["id"].as_str().expect("id should be a string");
    let secret = created["secret"].as_str().expect("secret should be returned at creation");
    assert!(!secret.is_empty());
    assert_eq!(created["is_active"], true);
    assert_eq!(created["events"], json!(["payment.received"]));

    let (status, fetched) = app.call(Method::GET, &format!("/webhooks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(fetched.get("secret").is_none());
    assert!(!fetched.to_string().contains(secret));

    let (status, listed) = app.call(Method::GET, "/webhooks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["total"], 1);
    assert!(!listed.to_string().contains(secret));
}

#[tokio::test]
async fn unknown_event_type_is_rejected_with_error_envelope() {
    let app = TestApp::new();

    let (status, body) = app
        .call(
            Method::POST,
            "/webhooks",
            Some(json!({"url": "https://example.com/hook", "events": ["order.shipped"]})),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
    assert!(body["error"]["message"].as_str().unwrap().contains("order.shipped"));
}

#[tokio::test]
async fn malformed_body_uses_the_same_envelope() {
    let app = TestApp::new();

    let (status, body) =
        app.call(Method::POST, "/webhooks", Some(json!({"events": ["user.created"]}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let app = TestApp::new();

    let (status, body) = app
        .call(Method::GET, "/webhooks/00000000-0000-4000-8000-000000000000", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = app.call(Method::GET, "/webhooks/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn partial_update_changes_only_given_fields() {
    let app = TestApp::new();
    let created = app.create_webhook("https://example.com/hook", &["user.created"]).await;
    let id = created["id"].as_str().unwrap();

    let (status, updated) = app
        .call(
            Method::PUT,
            &format!("/webhooks/{id}"),
            Some(json!({"description": "crm sync", "is_active": false})),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["description"], "crm sync");
    assert_eq!(updated["is_active"], false);
    assert_eq!(updated["url"], "https://example.com/hook");
    assert_eq!(updated["events"], json!(["user.created"]));

    let (status, body) = app
        .call(Method::PUT, &format!("/webhooks/{id}"), Some(json!({"events": []})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn deleted_webhook_disappears_from_reads() {
    let app = TestApp::new();
    let created = app.create_webhook("https://example.com/hook", &["user.created"]).await;
    let id = created["id"].as_str().unwrap();

    let (status, body) = app.call(Method::DELETE, &format!("/webhooks/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_null());

    let (status, _) = app.call(Method::GET, &format!("/webhooks/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.call(Method::DELETE, &format!("/webhooks/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, listed) = app.call(Method::GET, "/webhooks", None).await;
    assert_eq!(listed["total"], 0);
}

#[tokio::test]
async fn listing_is_paginated() {
    let app = TestApp::new();
    for n in 0..3 {
        app.create_webhook(&format!("https://example.com/{n}"), &["user.created"]).await;
        app.clock.advance(std::time::Duration::from_secs(1));
    }

    let (status, page) = app.call(Method::GET, "/webhooks?page=2&page_size=2", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 3);
    assert_eq!(page["page"], 2);
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert_eq!(page["items"][0]["url"], "https://example.com/2");
}

#[tokio::test]
async fn ip_allowlist_is_validated_and_stored() {
    let app = TestApp::new();
    let created = app.create_webhook("https://example.com/hook", &["user.created"]).await;
    let id = created["id"].as_str().unwrap();
    let uri = format!("/webhooks/{id}/security/ip-allowlist");

    let (status, body) = app
        .call(Method::PUT, &uri, Some(json!({"ips": ["10.0.0.0/8", "not-an-ip"], "enabled": true})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");

    let (status, webhook) = app
        .call(Method::PUT, &uri, Some(json!({"ips": ["10.0.0.0/8", "192.168.1.10"], "enabled": true})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(webhook["security"]["ip_allowlist_enabled"], true);
    assert_eq!(webhook["security"]["ip_allowlist"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn rate_limits_respect_ceilings() {
    let app = TestApp::new();
    let created = app.create_webhook("https://example.com/hook", &["user.created"]).await;
    let id = created["id"].as_str().unwrap();
    let uri = format!("/webhooks/{id}/security/rate-limits");

    let (status, body) =
        app.call(Method::PUT, &uri, Some(json!({"per_minute": 5000, "per_hour": 20000}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");

    let (status, webhook) =
        app.call(Method::PUT, &uri, Some(json!({"per_minute": 10, "per_hour": 200}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(webhook["security"]["rate_limit_per_minute"], 10);
    assert_eq!(webhook["security"]["rate_limit_per_hour"], 200);
}

#[tokio::test]
async fn rotation_returns_new_secret_and_grace_expiry() {
    let app = TestApp::new();
    let created = app.create_webhook("https://example.com/hook", &["user.created"]).await;
    let id = created["id"].as_str().unwrap();

    let (status, rotation) =
        app.call(Method::POST, &format!("/webhooks/{id}/security/rotate-secret"), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_ne!(rotation["new_secret"], created["secret"]);
    let expiry: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(rotation["old_secret_expiry"].clone()).unwrap();
    assert_eq!(expiry, app.clock_now() + chrono::Duration::days(7));
}
