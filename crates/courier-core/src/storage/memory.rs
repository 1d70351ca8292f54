//! In-memory storage.
//!
//! Backs tests and single-process deployments without `DATABASE_URL`.
//! Attempt inserts take one write lock over rows and the uniqueness index,
//! so the (event, webhook, attempt number) constraint holds under
//! concurrent dispatch.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{DeliveryStore, WebhookMutation, WebhookStore};
use crate::{
    error::{CoreError, Result},
    models::{
        DeliveryAttempt, DeliveryId, DeliveryStatus, Event, EventId, EventType, Page,
        PageRequest, Webhook, WebhookId,
    },
};

type PairKey = (EventId, WebhookId, u32);

#[derive(Debug, Default)]
struct AttemptTable {
    rows: HashMap<DeliveryId, DeliveryAttempt>,
    unique: HashMap<PairKey, DeliveryId>,
}

/// Process-local store for webhooks, events and attempts.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    webhooks: Arc<RwLock<HashMap<WebhookId, Webhook>>>,
    events: Arc<RwLock<HashMap<EventId, Event>>>,
    attempts: Arc<RwLock<AttemptTable>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt row, for test assertions.
    pub async fn all_attempts(&self) -> Vec<DeliveryAttempt> {
        let mut rows: Vec<_> = self.attempts.read().await.rows.values().cloned().collect();
        rows.sort_by_key(|a| (a.scheduled_at, a.attempt_number));
        rows
    }
}

#[async_trait]
impl WebhookStore for InMemoryStore {
    async fn insert_webhook(&self, webhook: Webhook) -> Result<()> {
        let mut webhooks = self.webhooks.write().await;
        if webhooks.contains_key(&webhook.id) {
            return Err(CoreError::conflict(format!("webhook {} already exists", webhook.id)));
        }
        webhooks.insert(webhook.id, webhook);
        Ok(())
    }

    async fn find_webhook(&self, id: WebhookId) -> Result<Option<Webhook>> {
        Ok(self.webhooks.read().await.get(&id).cloned())
    }

    async fn list_webhooks(&self, page: PageRequest) -> Result<Page<Webhook>> {
        let mut live: Vec<Webhook> =
            self.webhooks.read().await.values().filter(|w| !w.is_deleted()).cloned().collect();
        live.sort_by_key(|w| (w.created_at, w.id));
        Ok(Page::from_all(live, page))
    }

    async fn modify_webhook(&self, id: WebhookId, mutation: WebhookMutation) -> Result<Webhook> {
        let mut webhooks = self.webhooks.write().await;
        let Some(stored) = webhooks.get_mut(&id) else {
            return Err(CoreError::not_found(format!("webhook {id}")));
        };

        let mut updated = stored.clone();
        mutation(&mut updated)?;
        updated.id = stored.id;
        updated.last_called_at = stored.last_called_at;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn mark_called(&self, id: WebhookId, at: DateTime<Utc>) -> Result<()> {
        if let Some(webhook) = self.webhooks.write().await.get_mut(&id) {
            webhook.last_called_at = Some(at);
        }
        Ok(())
    }

    async fn subscribed_webhooks(&self, event_type: EventType) -> Result<Vec<Webhook>> {
        let mut matches: Vec<Webhook> = self
            .webhooks
            .read()
            .await
            .values()
            .filter(|w| w.accepts(event_type))
            .cloned()
            .collect();
        matches.sort_by_key(|w| (w.created_at, w.id));
        Ok(matches)
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn record_event(&self, event: Event) -> Result<bool> {
        let mut events = self.events.write().await;
        if events.contains_key(&event.id) {
            return Ok(false);
        }
        events.insert(event.id.clone(), event);
        Ok(true)
    }

    async fn find_event(&self, id: EventId) -> Result<Option<Event>> {
        Ok(self.events.read().await.get(&id).cloned())
    }

    async fn insert_attempt(&self, attempt: DeliveryAttempt) -> Result<()> {
        let mut table = self.attempts.write().await;
        let key = (attempt.event_id.clone(), attempt.webhook_id, attempt.attempt_number);
        if table.unique.contains_key(&key) {
            return Err(CoreError::conflict(format!(
                "attempt {} for event {} and webhook {} already exists",
                attempt.attempt_number, attempt.event_id, attempt.webhook_id
            )));
        }
        table.unique.insert(key, attempt.id);
        table.rows.insert(attempt.id, attempt);
        Ok(())
    }

    async fn update_attempt(&self, attempt: DeliveryAttempt) -> Result<()> {
        let mut table = self.attempts.write().await;
        let Some(stored) = table.rows.get_mut(&attempt.id) else {
            return Err(CoreError::not_found(format!("delivery attempt {}", attempt.id)));
        };
        if stored.status.is_terminal() {
            return Err(CoreError::conflict(format!(
                "delivery attempt {} is already {}",
                attempt.id, stored.status
            )));
        }
        *stored = attempt;
        Ok(())
    }

    async fn find_attempt(&self, id: DeliveryId) -> Result<Option<DeliveryAttempt>> {
        Ok(self.attempts.read().await.rows.get(&id).cloned())
    }

    async fn list_attempts(
        &self,
        webhook_id: WebhookId,
        status: Option<DeliveryStatus>,
        page: PageRequest,
    ) -> Result<Page<DeliveryAttempt>> {
        let mut rows: Vec<DeliveryAttempt> = self
            .attempts
            .read()
            .await
            .rows
            .values()
            .filter(|a| a.webhook_id == webhook_id)
            .filter(|a| status.is_none_or(|s| a.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.scheduled_at
                .cmp(&a.scheduled_at)
                .then_with(|| b.attempt_number.cmp(&a.attempt_number))
        });
        Ok(Page::from_all(rows, page))
    }

    async fn pair_attempts(
        &self,
        webhook_id: WebhookId,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>> {
        let mut rows: Vec<DeliveryAttempt> = self
            .attempts
            .read()
            .await
            .rows
            .values()
            .filter(|a| a.webhook_id == webhook_id && a.event_id == event_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.attempt_number);
        Ok(rows)
    }

    async fn pending_attempts(&self) -> Result<Vec<DeliveryAttempt>> {
        let mut rows: Vec<DeliveryAttempt> = self
            .attempts
            .read()
            .await
            .rows
            .values()
            .filter(|a| a.status == DeliveryStatus::Pending)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.scheduled_at);
        Ok(rows)
    }

    async fn stalled_retries(&self) -> Result<Vec<DeliveryAttempt>> {
        let table = self.attempts.read().await;
        let mut rows: Vec<DeliveryAttempt> = table
            .rows
            .values()
            .filter(|a| a.status == DeliveryStatus::Retrying)
            .filter(|a| {
                let successor = (a.event_id.clone(), a.webhook_id, a.attempt_number + 1);
                !table.unique.contains_key(&successor)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.next_retry_at);
        Ok(rows)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::models::{SecuritySettings, WebhookSecret};

    fn webhook(events: &[EventType]) -> Webhook {
        let now = Utc::now();
        Webhook {
            id: WebhookId::new(),
            url: "https://example.com/hook".to_string(),
            events: events.iter().copied().collect::<BTreeSet<_>>(),
            description: None,
            custom_headers: BTreeMap::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
            last_called_at: None,
            active_secret: WebhookSecret::new("whsec_test"),
            pending_old_secret: None,
            pending_old_secret_expiry: None,
            security: SecuritySettings::default(),
            deleted_at: None,
        }
    }

    fn attempt(hook: &Webhook, event_id: &str, number: u32) -> DeliveryAttempt {
        let now = Utc::now();
        DeliveryAttempt::pending(
            hook,
            EventId::parse(event_id).unwrap(),
            EventType::PaymentReceived,
            number,
            "{}".to_string(),
            now,
            now,
        )
    }

    #[tokio::test]
    async fn duplicate_attempt_numbers_conflict() {
        let store = InMemoryStore::new();
        let hook = webhook(&[EventType::PaymentReceived]);

        store.insert_attempt(attempt(&hook, "evt_1", 1)).await.unwrap();
        let err = store.insert_attempt(attempt(&hook, "evt_1", 1)).await.unwrap_err();

        assert!(matches!(err, CoreError::Conflict(_)));
        store.insert_attempt(attempt(&hook, "evt_1", 2)).await.unwrap();
        assert_eq!(store.all_attempts().await.len(), 2);
    }

    #[tokio::test]
    async fn terminal_attempts_are_immutable() {
        let store = InMemoryStore::new();
        let hook = webhook(&[EventType::PaymentReceived]);
        let mut row = attempt(&hook, "evt_1", 1);
        store.insert_attempt(row.clone()).await.unwrap();

        row.status = DeliveryStatus::Success;
        store.update_attempt(row.clone()).await.unwrap();

        row.status = DeliveryStatus::Failed;
        let err = store.update_attempt(row).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn subscribed_webhooks_skip_inactive_and_deleted() {
        let store = InMemoryStore::new();
        let live = webhook(&[EventType::PaymentReceived]);
        let mut inactive = webhook(&[EventType::PaymentReceived]);
        inactive.is_active = false;
        let mut deleted = webhook(&[EventType::PaymentReceived]);
        deleted.deleted_at = Some(Utc::now());
        let other = webhook(&[EventType::UserCreated]);

        for hook in [live.clone(), inactive, deleted, other] {
            store.insert_webhook(hook).await.unwrap();
        }

        let matches = store.subscribed_webhooks(EventType::PaymentReceived).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, live.id);
    }

    #[tokio::test]
    async fn list_attempts_filters_by_status() {
        let store = InMemoryStore::new();
        let hook = webhook(&[EventType::PaymentReceived]);
        let mut first = attempt(&hook, "evt_1", 1);
        store.insert_attempt(first.clone()).await.unwrap();
        store.insert_attempt(attempt(&hook, "evt_2", 1)).await.unwrap();

        first.status = DeliveryStatus::Success;
        store.update_attempt(first).await.unwrap();

        let page = store
            .list_attempts(hook.id, Some(DeliveryStatus::Success), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        let all = store.list_attempts(hook.id, None, PageRequest::default()).await.unwrap();
        assert_eq!(all.total, 2);
    }

    #[tokio::test]
    async fn rejected_mutation_leaves_row_untouched() {
        let store = InMemoryStore::new();
        let hook = webhook(&[EventType::PaymentReceived]);
        store.insert_webhook(hook.clone()).await.unwrap();

        let err = store
            .modify_webhook(
                hook.id,
                Box::new(|w| {
                    w.url = "https://changed.example.com".to_string();
                    Err(CoreError::validation("rejected"))
                }),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(store.find_webhook(hook.id).await.unwrap().unwrap().url, hook.url);
    }

    #[tokio::test]
    async fn retrying_rows_without_successor_are_stalled() {
        let store = InMemoryStore::new();
        let hook = webhook(&[EventType::PaymentReceived]);

        let mut stalled = attempt(&hook, "evt_1", 1);
        store.insert_attempt(stalled.clone()).await.unwrap();
        stalled.status = DeliveryStatus::Retrying;
        store.update_attempt(stalled.clone()).await.unwrap();

        let mut followed = attempt(&hook, "evt_2", 1);
        store.insert_attempt(followed.clone()).await.unwrap();
        followed.status = DeliveryStatus::Retrying;
        store.update_attempt(followed).await.unwrap();
        store.insert_attempt(attempt(&hook, "evt_2", 2)).await.unwrap();

        let rows = store.stalled_retries().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, stalled.id);
    }

    #[tokio::test]
    async fn events_are_recorded_once() {
        let store = InMemoryStore::new();
        let event = Event {
            id: EventId::parse("evt_1").unwrap(),
            event_type: EventType::PaymentReceived,
            created_at: Utc::now(),
            data: serde_json::json!({}),
        };

        assert!(store.record_event(event.clone()).await.unwrap());
        assert!(!store.record_event(event.clone()).await.unwrap());
        assert_eq!(store.find_event(event.id.clone()).await.unwrap(), Some(event));
    }
}
