//! PostgreSQL storage.
//!
//! Queries are checked at runtime rather than with `query!` macros so the
//! crate builds without a live database. Rows are mapped by hand through
//! `sqlx::Row`.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};
use uuid::Uuid;

use super::{DeliveryStore, WebhookMutation, WebhookStore};
use crate::{
    error::{CoreError, Result},
    models::{
        DeliveryAttempt, DeliveryId, DeliveryStatus, Event, EventId, EventType, Page,
        PageRequest, SecuritySettings, Webhook, WebhookId, WebhookSecret,
    },
};

const SCHEMA: [&str; 6] = [
    r"
    CREATE TABLE IF NOT EXISTS webhooks (
        id UUID PRIMARY KEY,
        url TEXT NOT NULL,
        events TEXT[] NOT NULL,
        description TEXT,
        custom_headers JSONB NOT NULL DEFAULT '{}'::jsonb,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        active_secret TEXT NOT NULL,
        pending_old_secret TEXT,
        pending_old_secret_expiry TIMESTAMPTZ,
        ip_allowlist TEXT[] NOT NULL DEFAULT '{}',
        ip_allowlist_enabled BOOLEAN NOT NULL DEFAULT FALSE,
        rate_limit_per_minute INTEGER CHECK (rate_limit_per_minute > 0),
        rate_limit_per_hour INTEGER CHECK (rate_limit_per_hour > 0),
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        last_called_at TIMESTAMPTZ,
        deleted_at TIMESTAMPTZ
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        data JSONB NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS delivery_attempts (
        id UUID PRIMARY KEY,
        webhook_id UUID NOT NULL REFERENCES webhooks(id),
        event_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        attempt_number INTEGER NOT NULL CHECK (attempt_number >= 1),
        request_url TEXT NOT NULL,
        request_headers JSONB NOT NULL DEFAULT '{}'::jsonb,
        request_body TEXT NOT NULL,
        response_code INTEGER,
        response_body_excerpt TEXT,
        error_message TEXT,
        error_kind TEXT,
        status TEXT NOT NULL,
        scheduled_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        next_retry_at TIMESTAMPTZ,
        UNIQUE (event_id, webhook_id, attempt_number)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_webhooks_active ON webhooks (is_active) WHERE deleted_at IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_attempts_webhook ON delivery_attempts (webhook_id, scheduled_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_attempts_pending ON delivery_attempts (scheduled_at) WHERE status = 'pending'",
];

const WEBHOOK_COLUMNS: &str = "id, url, events, description, custom_headers, is_active, \
    active_secret, pending_old_secret, pending_old_secret_expiry, ip_allowlist, \
    ip_allowlist_enabled, rate_limit_per_minute, rate_limit_per_hour, created_at, updated_at, \
    last_called_at, deleted_at";

const ATTEMPT_COLUMNS: &str = "id, webhook_id, event_id, event_type, attempt_number, \
    request_url, request_headers, request_body, response_code, response_body_excerpt, \
    error_message, error_kind, status, scheduled_at, updated_at, next_retry_at";

/// `WebhookStore` and `DeliveryStore` backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wraps an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert_webhook_impl(&self, webhook: &Webhook) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO webhooks (
                id, url, events, description, custom_headers, is_active,
                active_secret, pending_old_secret, pending_old_secret_expiry,
                ip_allowlist, ip_allowlist_enabled, rate_limit_per_minute,
                rate_limit_per_hour, created_at, updated_at, last_called_at, deleted_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ",
        )
        .bind(webhook.id)
        .bind(&webhook.url)
        .bind(event_names(&webhook.events))
        .bind(&webhook.description)
        .bind(Json(&webhook.custom_headers))
        .bind(webhook.is_active)
        .bind(webhook.active_secret.expose())
        .bind(webhook.pending_old_secret.as_ref().map(WebhookSecret::expose))
        .bind(webhook.pending_old_secret_expiry)
        .bind(&webhook.security.ip_allowlist)
        .bind(webhook.security.ip_allowlist_enabled)
        .bind(webhook.security.rate_limit_per_minute.map(to_i32))
        .bind(webhook.security.rate_limit_per_hour.map(to_i32))
        .bind(webhook.created_at)
        .bind(webhook.updated_at)
        .bind(webhook.last_called_at)
        .bind(webhook.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn modify_webhook_impl(
        &self,
        id: WebhookId,
        mutation: WebhookMutation,
    ) -> Result<Webhook> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(CoreError::not_found(format!("webhook {id}")));
        };

        let stored = webhook_from_row(&row)?;
        let mut webhook = stored.clone();
        mutation(&mut webhook)?;
        webhook.id = stored.id;
        webhook.last_called_at = stored.last_called_at;

        sqlx::query(
            r"
            UPDATE webhooks SET
                url = $2, events = $3, description = $4, custom_headers = $5,
                is_active = $6, active_secret = $7, pending_old_secret = $8,
                pending_old_secret_expiry = $9, ip_allowlist = $10,
                ip_allowlist_enabled = $11, rate_limit_per_minute = $12,
                rate_limit_per_hour = $13, updated_at = $14, deleted_at = $15
            WHERE id = $1
            ",
        )
        .bind(webhook.id)
        .bind(&webhook.url)
        .bind(event_names(&webhook.events))
        .bind(&webhook.description)
        .bind(Json(&webhook.custom_headers))
        .bind(webhook.is_active)
        .bind(webhook.active_secret.expose())
        .bind(webhook.pending_old_secret.as_ref().map(WebhookSecret::expose))
        .bind(webhook.pending_old_secret_expiry)
        .bind(&webhook.security.ip_allowlist)
        .bind(webhook.security.ip_allowlist_enabled)
        .bind(webhook.security.rate_limit_per_minute.map(to_i32))
        .bind(webhook.security.rate_limit_per_hour.map(to_i32))
        .bind(webhook.updated_at)
        .bind(webhook.deleted_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(webhook)
    }

    async fn list_webhooks_impl(&self, page: PageRequest) -> Result<Page<Webhook>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM webhooks WHERE deleted_at IS NULL")
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE deleted_at IS NULL \
             ORDER BY created_at ASC, id ASC LIMIT $1 OFFSET $2"
        ))
        .bind(i64::from(page.page_size))
        .bind(offset(page))
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: rows.iter().map(webhook_from_row).collect::<Result<_>>()?,
            page: page.page,
            page_size: page.page_size,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    async fn insert_attempt_impl(&self, attempt: &DeliveryAttempt) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO delivery_attempts (
                id, webhook_id, event_id, event_type, attempt_number, request_url,
                request_headers, request_body, response_code, response_body_excerpt,
                error_message, error_kind, status, scheduled_at, updated_at, next_retry_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ",
        )
        .bind(attempt.id)
        .bind(attempt.webhook_id)
        .bind(attempt.event_id.as_str())
        .bind(attempt.event_type.as_str())
        .bind(to_i32(attempt.attempt_number))
        .bind(&attempt.request_url)
        .bind(Json(&attempt.request_headers))
        .bind(&attempt.request_body)
        .bind(attempt.response_code.map(i32::from))
        .bind(&attempt.response_body_excerpt)
        .bind(&attempt.error_message)
        .bind(attempt.error_kind.map(|kind| kind.as_str()))
        .bind(attempt.status.as_str())
        .bind(attempt.scheduled_at)
        .bind(attempt.timestamp)
        .bind(attempt.next_retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_attempt_impl(&self, attempt: &DeliveryAttempt) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE delivery_attempts SET
                request_url = $2, request_headers = $3, request_body = $4,
                response_code = $5, response_body_excerpt = $6, error_message = $7,
                error_kind = $8, status = $9, updated_at = $10, next_retry_at = $11
            WHERE id = $1
              AND status NOT IN ('success', 'failed', 'max_retries_exceeded')
            ",
        )
        .bind(attempt.id)
        .bind(&attempt.request_url)
        .bind(Json(&attempt.request_headers))
        .bind(&attempt.request_body)
        .bind(attempt.response_code.map(i32::from))
        .bind(&attempt.response_body_excerpt)
        .bind(&attempt.error_message)
        .bind(attempt.error_kind.map(|kind| kind.as_str()))
        .bind(attempt.status.as_str())
        .bind(attempt.timestamp)
        .bind(attempt.next_retry_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.find_attempt_impl(attempt.id).await? {
            Some(stored) => Err(CoreError::conflict(format!(
                "delivery attempt {} is already {}",
                attempt.id, stored.status
            ))),
            None => Err(CoreError::not_found(format!("delivery attempt {}", attempt.id))),
        }
    }

    async fn find_attempt_impl(&self, id: DeliveryId) -> Result<Option<DeliveryAttempt>> {
        let row = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(attempt_from_row).transpose()
    }

    async fn list_attempts_impl(
        &self,
        webhook_id: WebhookId,
        status: Option<DeliveryStatus>,
        page: PageRequest,
    ) -> Result<Page<DeliveryAttempt>> {
        let status = status.map(DeliveryStatus::as_str);

        let total: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*) FROM delivery_attempts
            WHERE webhook_id = $1 AND ($2::TEXT IS NULL OR status = $2)
            ",
        )
        .bind(webhook_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts \
             WHERE webhook_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY scheduled_at DESC, attempt_number DESC LIMIT $3 OFFSET $4"
        ))
        .bind(webhook_id)
        .bind(status)
        .bind(i64::from(page.page_size))
        .bind(offset(page))
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: rows.iter().map(attempt_from_row).collect::<Result<_>>()?,
            page: page.page,
            page_size: page.page_size,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl WebhookStore for PostgresStore {
    async fn insert_webhook(&self, webhook: Webhook) -> Result<()> {
        self.insert_webhook_impl(&webhook).await
    }

    async fn find_webhook(&self, id: WebhookId) -> Result<Option<Webhook>> {
        let row = sqlx::query(&format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(webhook_from_row).transpose()
    }

    async fn list_webhooks(&self, page: PageRequest) -> Result<Page<Webhook>> {
        self.list_webhooks_impl(page).await
    }

    async fn modify_webhook(&self, id: WebhookId, mutation: WebhookMutation) -> Result<Webhook> {
        self.modify_webhook_impl(id, mutation).await
    }

    async fn mark_called(&self, id: WebhookId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE webhooks SET last_called_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribed_webhooks(&self, event_type: EventType) -> Result<Vec<Webhook>> {
        let rows = sqlx::query(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks \
             WHERE is_active AND deleted_at IS NULL AND $1 = ANY(events) \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(event_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(webhook_from_row).collect()
    }
}

#[async_trait]
impl DeliveryStore for PostgresStore {
    async fn record_event(&self, event: Event) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO events (id, event_type, created_at, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(event.id.as_str())
        .bind(event.event_type.as_str())
        .bind(event.created_at)
        .bind(Json(&event.data))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_event(&self, id: EventId) -> Result<Option<Event>> {
        let row = sqlx::query("SELECT id, event_type, created_at, data FROM events WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn insert_attempt(&self, attempt: DeliveryAttempt) -> Result<()> {
        self.insert_attempt_impl(&attempt).await
    }

    async fn update_attempt(&self, attempt: DeliveryAttempt) -> Result<()> {
        self.update_attempt_impl(&attempt).await
    }

    async fn find_attempt(&self, id: DeliveryId) -> Result<Option<DeliveryAttempt>> {
        self.find_attempt_impl(id).await
    }

    async fn list_attempts(
        &self,
        webhook_id: WebhookId,
        status: Option<DeliveryStatus>,
        page: PageRequest,
    ) -> Result<Page<DeliveryAttempt>> {
        self.list_attempts_impl(webhook_id, status, page).await
    }

    async fn pair_attempts(
        &self,
        webhook_id: WebhookId,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts \
             WHERE webhook_id = $1 AND event_id = $2 ORDER BY attempt_number ASC"
        ))
        .bind(webhook_id)
        .bind(event_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn pending_attempts(&self) -> Result<Vec<DeliveryAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts \
             WHERE status = 'pending' ORDER BY scheduled_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn stalled_retries(&self) -> Result<Vec<DeliveryAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts AS cur \
             WHERE cur.status = 'retrying' AND NOT EXISTS ( \
                 SELECT 1 FROM delivery_attempts AS nxt \
                 WHERE nxt.event_id = cur.event_id \
                   AND nxt.webhook_id = cur.webhook_id \
                   AND nxt.attempt_number = cur.attempt_number + 1) \
             ORDER BY cur.next_retry_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn event_names(events: &BTreeSet<EventType>) -> Vec<String> {
    events.iter().map(ToString::to_string).collect()
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn offset(page: PageRequest) -> i64 {
    i64::try_from(page.offset()).unwrap_or(i64::MAX)
}

fn corrupt(column: &str, detail: impl std::fmt::Display) -> CoreError {
    CoreError::Database(format!("corrupt {column} column: {detail}"))
}

fn positive(column: &str, value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|e| corrupt(column, e))
}

fn webhook_from_row(row: &PgRow) -> Result<Webhook> {
    let events = row
        .try_get::<Vec<String>, _>("events")?
        .iter()
        .map(|name| name.parse::<EventType>().map_err(|e| corrupt("events", e)))
        .collect::<Result<BTreeSet<_>>>()?;

    let rate_limit_per_minute = row
        .try_get::<Option<i32>, _>("rate_limit_per_minute")?
        .map(|v| positive("rate_limit_per_minute", v))
        .transpose()?;
    let rate_limit_per_hour = row
        .try_get::<Option<i32>, _>("rate_limit_per_hour")?
        .map(|v| positive("rate_limit_per_hour", v))
        .transpose()?;

    Ok(Webhook {
        id: WebhookId(row.try_get::<Uuid, _>("id")?),
        url: row.try_get("url")?,
        events,
        description: row.try_get("description")?,
        custom_headers: row.try_get::<Json<BTreeMap<String, String>>, _>("custom_headers")?.0,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_called_at: row.try_get("last_called_at")?,
        active_secret: WebhookSecret::new(row.try_get::<String, _>("active_secret")?),
        pending_old_secret: row
            .try_get::<Option<String>, _>("pending_old_secret")?
            .map(WebhookSecret::new),
        pending_old_secret_expiry: row.try_get("pending_old_secret_expiry")?,
        security: SecuritySettings {
            ip_allowlist: row.try_get("ip_allowlist")?,
            ip_allowlist_enabled: row.try_get("ip_allowlist_enabled")?,
            rate_limit_per_minute,
            rate_limit_per_hour,
        },
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<Event> {
    let id: String = row.try_get("id")?;
    let event_type: String = row.try_get("event_type")?;
    Ok(Event {
        id: EventId::parse(id).map_err(|e| corrupt("id", e))?,
        event_type: event_type.parse().map_err(|e| corrupt("event_type", e))?,
        created_at: row.try_get("created_at")?,
        data: row.try_get::<Json<serde_json::Value>, _>("data")?.0,
    })
}

fn attempt_from_row(row: &PgRow) -> Result<DeliveryAttempt> {
    let event_id: String = row.try_get("event_id")?;
    let event_type: String = row.try_get("event_type")?;
    let status: String = row.try_get("status")?;
    let error_kind: Option<String> = row.try_get("error_kind")?;
    let response_code = row
        .try_get::<Option<i32>, _>("response_code")?
        .map(|code| u16::try_from(code).map_err(|e| corrupt("response_code", e)))
        .transpose()?;

    Ok(DeliveryAttempt {
        id: DeliveryId(row.try_get::<Uuid, _>("id")?),
        webhook_id: WebhookId(row.try_get::<Uuid, _>("webhook_id")?),
        event_id: EventId::parse(event_id).map_err(|e| corrupt("event_id", e))?,
        event_type: event_type.parse().map_err(|e| corrupt("event_type", e))?,
        attempt_number: positive("attempt_number", row.try_get("attempt_number")?)?,
        request_url: row.try_get("request_url")?,
        request_headers: row.try_get::<Json<BTreeMap<String, String>>, _>("request_headers")?.0,
        request_body: row.try_get("request_body")?,
        response_code,
        response_body_excerpt: row.try_get("response_body_excerpt")?,
        error_message: row.try_get("error_message")?,
        error_kind: error_kind
            .map(|kind| kind.parse().map_err(|e| corrupt("error_kind", e)))
            .transpose()?,
        status: status.parse().map_err(|e| corrupt("status", e))?,
        scheduled_at: row.try_get("scheduled_at")?,
        timestamp: row.try_get("updated_at")?,
        next_retry_at: row.try_get("next_retry_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_enforces_attempt_uniqueness() {
        let attempts = SCHEMA.iter().find(|s| s.contains("delivery_attempts (")).unwrap();
        assert!(attempts.contains("UNIQUE (event_id, webhook_id, attempt_number)"));
    }

    #[test]
    fn offsets_follow_page_requests() {
        assert_eq!(offset(PageRequest::new(Some(3), Some(25))), 50);
        assert_eq!(to_i32(u32::MAX), i32::MAX);
    }
}
