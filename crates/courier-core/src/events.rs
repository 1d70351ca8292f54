//! Delivery outcome notifications.
//!
//! The worker publishes one `DeliveryEvent` per finished attempt. Alerting
//! and metrics live outside this subsystem and subscribe through
//! `EventHandler`; a handler must never block or fail delivery processing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::models::{AttemptErrorKind, DeliveryId, EventId, WebhookId};

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// Receiver answered 2xx.
    Succeeded(DeliverySucceededEvent),
    /// Attempt failed and a retry was scheduled, or it was cancelled.
    Failed(DeliveryFailedEvent),
    /// Final permitted attempt failed.
    Exhausted(DeliveryExhaustedEvent),
}

/// Emitted when a delivery succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySucceededEvent {
    /// Attempt row id.
    pub delivery_id: DeliveryId,
    /// Target webhook.
    pub webhook_id: WebhookId,
    /// Delivered event.
    pub event_id: EventId,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Receiver status code.
    pub response_code: u16,
    /// Completion time.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted when an attempt fails but the pair is not yet exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailedEvent {
    /// Attempt row id.
    pub delivery_id: DeliveryId,
    /// Target webhook.
    pub webhook_id: WebhookId,
    /// Event being delivered.
    pub event_id: EventId,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Failure classification.
    pub error_kind: AttemptErrorKind,
    /// Failure description.
    pub error_message: String,
    /// Scheduled follow-up, if any.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Emitted when the retry budget is spent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryExhaustedEvent {
    /// Final attempt row id.
    pub delivery_id: DeliveryId,
    /// Target webhook.
    pub webhook_id: WebhookId,
    /// Undeliverable event.
    pub event_id: EventId,
    /// Number of attempts made.
    pub attempts: u32,
    /// Error of the final attempt.
    pub last_error: String,
    /// When the pair was given up on.
    pub exhausted_at: DateTime<Utc>,
}

/// Subscriber for delivery outcomes.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one outcome. Errors are the handler's own to log.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Writes each outcome to the tracing log.
///
/// Exhausted deliveries log at error level so log-based alerting can pick
/// them up.
#[derive(Debug, Default)]
pub struct TracingEventHandler;

#[async_trait::async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        match event {
            DeliveryEvent::Succeeded(e) => info!(
                delivery_id = %e.delivery_id,
                webhook_id = %e.webhook_id,
                event_id = %e.event_id,
                attempt_number = e.attempt_number,
                response_code = e.response_code,
                "webhook delivered"
            ),
            DeliveryEvent::Failed(e) => warn!(
                delivery_id = %e.delivery_id,
                webhook_id = %e.webhook_id,
                event_id = %e.event_id,
                attempt_number = e.attempt_number,
                error_kind = %e.error_kind,
                error = %e.error_message,
                "webhook delivery attempt failed"
            ),
            DeliveryEvent::Exhausted(e) => error!(
                delivery_id = %e.delivery_id,
                webhook_id = %e.webhook_id,
                event_id = %e.event_id,
                attempts = e.attempts,
                error = %e.last_error,
                "webhook delivery exhausted retries"
            ),
        }
    }
}

/// Fans each event out to every subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move { handler.handle_event(event).await }
        });
        futures::future::join_all(futures).await;
    }
}
