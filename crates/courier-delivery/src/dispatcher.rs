//! Fan-out of events to subscribed webhooks.
//!
//! `dispatch` records the event, creates one pending attempt 1 per active
//! subscriber, and queues it. The store's (event, webhook, attempt number)
//! uniqueness makes repeated dispatch of the same event a no-op for pairs
//! that already have an attempt.

use std::sync::Arc;

use courier_core::{
    Clock, CoreError, DeliveryAttempt, DeliveryId, DeliveryStore, Event, EventId,
    WebhookRegistry,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    error::Result,
    queue::{DeliveryQueue, DeliveryTask},
};

/// What a dispatch call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Dispatched event.
    pub event_id: EventId,
    /// `false` when the event id had been dispatched before.
    pub first_seen: bool,
    /// Active webhooks subscribed to the event type.
    pub matched_webhooks: usize,
    /// Attempt rows created by this call.
    pub attempts: Vec<DeliveryId>,
}

/// Matches events to subscribers and enqueues first attempts.
#[derive(Clone)]
pub struct Dispatcher {
    registry: WebhookRegistry,
    store: Arc<dyn DeliveryStore>,
    queue: Arc<DeliveryQueue>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher feeding `queue`.
    pub fn new(
        registry: WebhookRegistry,
        store: Arc<dyn DeliveryStore>,
        queue: Arc<DeliveryQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { registry, store, queue, clock }
    }

    /// Dispatches `event` to every active subscriber.
    ///
    /// An event id seen before is delivered with the payload stored the
    /// first time. Events matching no webhook are recorded and otherwise
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the store fails, or a validation
    /// error if the payload cannot be serialized.
    pub async fn dispatch(&self, event: Event) -> Result<DispatchReport> {
        let event_id = event.id.clone();
        let first_seen = self.store.record_event(event.clone()).await?;
        let event = if first_seen {
            event
        } else {
            debug!(event_id = %event_id, "event dispatched again; using stored payload");
            self.store.find_event(event_id.clone()).await?.unwrap_or(event)
        };

        let subscribers = self.registry.subscribers(event.event_type).await?;
        if subscribers.is_empty() {
            debug!(event_id = %event_id, event_type = %event.event_type, "event matched no active webhooks");
            return Ok(DispatchReport { event_id, first_seen, matched_webhooks: 0, attempts: Vec::new() });
        }

        let body = event.canonical_body()?;
        let body = String::from_utf8(body.to_vec())
            .map_err(|e| CoreError::validation(format!("event body is not utf-8: {e}")))?;
        let now = self.clock.now_utc();

        let mut attempts = Vec::with_capacity(subscribers.len());
        for webhook in &subscribers {
            let attempt = DeliveryAttempt::pending(
                webhook,
                event.id.clone(),
                event.event_type,
                1,
                body.clone(),
                now,
                now,
            );
            let task = DeliveryTask::for_attempt(&attempt);

            match self.store.insert_attempt(attempt).await {
                Ok(()) => {
                    attempts.push(task.attempt_id);
                    self.queue.push(task, now);
                },
                Err(CoreError::Conflict(_)) => {
                    debug!(
                        event_id = %event.id,
                        webhook_id = %webhook.id,
                        "pair already dispatched; skipping"
                    );
                },
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            matched = subscribers.len(),
            created = attempts.len(),
            "event dispatched"
        );

        Ok(DispatchReport { event_id, first_seen, matched_webhooks: subscribers.len(), attempts })
    }
}
