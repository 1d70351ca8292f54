//! Router fixtures for API integration tests.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use courier_api::{create_router, AppState};
use courier_core::{storage::InMemoryStore, Clock, RegistryConfig, TestClock, WebhookRegistry};
use courier_delivery::{DeliveryConfig, DeliveryEngine};
use serde_json::Value;
use tower::ServiceExt;

/// Router over an in-memory store and an engine that is never started, so
/// dispatched attempts stay pending and can be inspected.
pub struct TestApp {
    pub router: Router,
    pub engine: DeliveryEngine,
    pub registry: WebhookRegistry,
    pub store: InMemoryStore,
    pub clock: TestClock,
}

impl TestApp {
    pub fn new() -> Self {
        let store = InMemoryStore::new();
        let clock = TestClock::starting_at(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let registry = WebhookRegistry::new(
            Arc::new(store.clone()),
            shared_clock.clone(),
            RegistryConfig { allow_insecure_urls: true, ..Default::default() },
        );
        let engine = DeliveryEngine::new(
            registry.clone(),
            Arc::new(store.clone()),
            DeliveryConfig::default(),
            shared_clock.clone(),
        )
        .expect("engine should build");

        let state =
            AppState::from_engine(&engine, registry.clone(), Arc::new(store.clone()), shared_clock);
        let router = create_router(state, Duration::from_secs(30));

        Self { router, engine, registry, store, clock }
    }

    /// Sends one request and returns the status and parsed JSON body
    /// (`Value::Null` for empty bodies).
    pub async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("request should build");

        let response = self.router.clone().oneshot(request).await.expect("router should respond");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("failed to read response body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("response should be JSON")
        };
        (status, json)
    }

    pub fn clock_now(&self) -> chrono::DateTime<Utc> {
        self.clock.now_utc()
    }

    pub async fn create_webhook(&self, url: &str, events: &[&str]) -> Value {
        let (status, body) = self
            .call(Method::POST, "/webhooks", Some(serde_json::json!({"url": url, "events": events})))
            .await;
        assert_eq!(status, StatusCode::CREATED, "unexpected body: {body}");
        body
    }
}
