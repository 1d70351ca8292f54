//! Shared fixtures for delivery integration tests.

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use courier_core::{
    registry::{NewWebhook, Registration},
    storage::InMemoryStore,
    Clock, DeliveryAttempt, DeliveryEvent, DeliveryStore, Event, EventHandler, EventId, EventType,
    RegistryConfig, TestClock, WebhookId, WebhookRegistry,
};
use courier_delivery::{DeliveryConfig, DeliveryEngine};

/// Engine wired to an in-memory store and a manual clock.
pub struct TestEnv {
    pub engine: DeliveryEngine,
    pub registry: WebhookRegistry,
    pub store: InMemoryStore,
    pub clock: TestClock,
    pub events: Arc<RecordingHandler>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(DeliveryConfig::default())
    }

    pub fn with_config(config: DeliveryConfig) -> Self {
        init_tracing();
        let store = InMemoryStore::new();
        let clock = TestClock::starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let registry = WebhookRegistry::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            RegistryConfig { allow_insecure_urls: true, ..Default::default() },
        );
        let events = Arc::new(RecordingHandler::default());
        let engine = DeliveryEngine::with_event_handler(
            registry.clone(),
            Arc::new(store.clone()),
            config,
            Arc::new(clock.clone()) as Arc<dyn Clock>,
            events.clone(),
        )
        .expect("engine should build");

        Self { engine, registry, store, clock, events }
    }

    pub async fn register(&self, url: &str, events: &[&str]) -> Registration {
        self.registry
            .register(NewWebhook {
                url: url.to_string(),
                events: events.iter().map(ToString::to_string).collect(),
                description: Some("integration test".into()),
                headers: BTreeMap::new(),
                is_active: None,
            })
            .await
            .expect("registration should succeed")
    }

    pub fn event(&self, id: &str, event_type: EventType) -> Event {
        Event {
            id: EventId::parse(id).unwrap(),
            event_type,
            created_at: self.clock.now_utc(),
            data: serde_json::json!({"amount": 4200, "currency": "EUR"}),
        }
    }

    /// Attempts for one pair, ordered by attempt number.
    pub async fn pair(&self, webhook_id: WebhookId, event_id: &str) -> Vec<DeliveryAttempt> {
        self.store.pair_attempts(webhook_id, EventId::parse(event_id).unwrap()).await.unwrap()
    }

    /// Advances the clock and runs whatever fell due.
    pub async fn advance_and_process(&self, minutes: u64) -> usize {
        self.clock.advance_minutes(minutes);
        self.engine.process_due().await.unwrap()
    }
}

/// Event handler that keeps every outcome it sees.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<DeliveryEvent>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.seen.lock().unwrap().push(event);
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
