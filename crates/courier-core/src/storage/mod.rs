//! Storage seams for webhooks, events and delivery attempts.
//!
//! The registry owns webhook rows through `WebhookStore`; the delivery side
//! owns events and attempts through `DeliveryStore`. Two implementations
//! ship: `memory::InMemoryStore` and `postgres::PostgresStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    models::{
        DeliveryAttempt, DeliveryId, DeliveryStatus, Event, EventId, EventType, Page,
        PageRequest, Webhook, WebhookId,
    },
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Change applied to one webhook row while the store holds it exclusively.
///
/// Returning an error aborts the change and leaves the row untouched.
pub type WebhookMutation = Box<dyn FnOnce(&mut Webhook) -> Result<()> + Send>;

/// Persistence for webhook subscriptions.
#[async_trait]
pub trait WebhookStore: Send + Sync + 'static {
    /// Inserts a new webhook.
    async fn insert_webhook(&self, webhook: Webhook) -> Result<()>;

    /// Finds a webhook by id, tombstoned rows included.
    async fn find_webhook(&self, id: WebhookId) -> Result<Option<Webhook>>;

    /// Lists non-deleted webhooks ordered by creation time.
    async fn list_webhooks(&self, page: PageRequest) -> Result<Page<Webhook>>;

    /// Applies `mutation` to the stored row and returns the new row.
    ///
    /// Concurrent modifications of one webhook are serialized, so none is
    /// lost. `last_called_at` is owned by `mark_called` and is never
    /// written back from a mutation. Fails with `CoreError::NotFound` if the
    /// row does not exist.
    async fn modify_webhook(&self, id: WebhookId, mutation: WebhookMutation) -> Result<Webhook>;

    /// Records a successful delivery time.
    async fn mark_called(&self, id: WebhookId, at: DateTime<Utc>) -> Result<()>;

    /// Active, non-deleted webhooks subscribed to `event_type`.
    async fn subscribed_webhooks(&self, event_type: EventType) -> Result<Vec<Webhook>>;
}

/// Persistence for events and delivery attempts.
#[async_trait]
pub trait DeliveryStore: Send + Sync + 'static {
    /// Records an event. Returns `false` if an event with the same id exists.
    async fn record_event(&self, event: Event) -> Result<bool>;

    /// Finds an event by id.
    async fn find_event(&self, id: EventId) -> Result<Option<Event>>;

    /// Inserts a new attempt row.
    ///
    /// Fails with `CoreError::Conflict` if a row for the same
    /// (event, webhook, attempt number) triple exists.
    async fn insert_attempt(&self, attempt: DeliveryAttempt) -> Result<()>;

    /// Updates a non-terminal attempt row in place.
    ///
    /// Fails with `CoreError::Conflict` if the stored row is already
    /// terminal, or `CoreError::NotFound` if it does not exist.
    async fn update_attempt(&self, attempt: DeliveryAttempt) -> Result<()>;

    /// Finds one attempt.
    async fn find_attempt(&self, id: DeliveryId) -> Result<Option<DeliveryAttempt>>;

    /// Attempts for one webhook, newest first, optionally filtered by status.
    async fn list_attempts(
        &self,
        webhook_id: WebhookId,
        status: Option<DeliveryStatus>,
        page: PageRequest,
    ) -> Result<Page<DeliveryAttempt>>;

    /// All attempts for one (webhook, event) pair in attempt order.
    async fn pair_attempts(
        &self,
        webhook_id: WebhookId,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>>;

    /// Every attempt still `pending`, oldest schedule first.
    async fn pending_attempts(&self) -> Result<Vec<DeliveryAttempt>>;

    /// `retrying` attempts whose follow-up row was never inserted.
    async fn stalled_retries(&self) -> Result<Vec<DeliveryAttempt>>;

    /// Verifies the backend is reachable.
    async fn health_check(&self) -> Result<()>;
}
