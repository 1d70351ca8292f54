//! Webhook registry: the only writer of webhook records.
//!
//! Every mutation validates its input completely before loading or writing
//! the stored row, so a rejected call leaves the webhook untouched.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    allowlist::IpAllowlist,
    error::{CoreError, Result},
    models::{EventType, Page, PageRequest, SecuritySettings, Webhook, WebhookId, WebhookSecret},
    signing::generate_secret,
    storage::WebhookStore,
    time::Clock,
    validation::{validate_custom_headers, validate_events, validate_rate_limits, validate_url},
};

/// Default grace period during which a rotated-out secret still verifies.
pub const DEFAULT_ROTATION_GRACE_DAYS: i64 = 7;

/// Operator-controlled registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Admit `http://` destinations. Local development and tests only.
    pub allow_insecure_urls: bool,
    /// Per-minute cap applied when a webhook sets none.
    pub default_rate_limit_per_minute: u32,
    /// Per-hour cap applied when a webhook sets none.
    pub default_rate_limit_per_hour: u32,
    /// Highest per-minute cap a webhook may request.
    pub rate_limit_ceiling_per_minute: u32,
    /// Highest per-hour cap a webhook may request.
    pub rate_limit_ceiling_per_hour: u32,
    /// How long the previous secret stays valid after rotation.
    pub rotation_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            allow_insecure_urls: false,
            default_rate_limit_per_minute: 100,
            default_rate_limit_per_hour: 1000,
            rate_limit_ceiling_per_minute: 1000,
            rate_limit_ceiling_per_hour: 10_000,
            rotation_grace: Duration::days(DEFAULT_ROTATION_GRACE_DAYS),
        }
    }
}

/// Registration request.
#[derive(Debug, Clone, Deserialize)]
pub struct NewWebhook {
    /// HTTPS destination.
    pub url: String,
    /// Event type names to subscribe to.
    pub events: Vec<String>,
    /// Optional operator description.
    #[serde(default)]
    pub description: Option<String>,
    /// Extra headers for every delivery.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Defaults to `true`.
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookUpdate {
    /// New destination.
    pub url: Option<String>,
    /// Replacement subscription set; must stay non-empty.
    pub events: Option<Vec<String>>,
    /// New description.
    pub description: Option<String>,
    /// Replacement custom headers.
    pub headers: Option<BTreeMap<String, String>>,
    /// Activate or deactivate.
    pub is_active: Option<bool>,
}

/// Result of a registration. The secret is never returned again.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Stored webhook.
    pub webhook: Webhook,
    /// One-time copy of the signing secret.
    pub secret: WebhookSecret,
}

/// Result of a secret rotation.
#[derive(Debug, Clone)]
pub struct SecretRotation {
    /// Newly installed signing secret, shown once.
    pub new_secret: WebhookSecret,
    /// When the previous secret stops verifying.
    pub old_secret_expiry: DateTime<Utc>,
}

/// CRUD and security configuration for webhook subscriptions.
#[derive(Clone)]
pub struct WebhookRegistry {
    store: Arc<dyn WebhookStore>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

impl std::fmt::Debug for WebhookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookRegistry").field("config", &self.config).finish_non_exhaustive()
    }
}

impl WebhookRegistry {
    /// Creates a registry over `store`.
    pub fn new(store: Arc<dyn WebhookStore>, clock: Arc<dyn Clock>, config: RegistryConfig) -> Self {
        Self { store, clock, config }
    }

    /// Registry settings.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Registers a webhook with a freshly generated secret.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for a non-HTTPS URL, an empty or
    /// unrecognized event list, or invalid custom headers.
    pub async fn register(&self, request: NewWebhook) -> Result<Registration> {
        let url = validate_url(&request.url, self.config.allow_insecure_urls)?;
        let events = validate_events(&request.events)?;
        validate_custom_headers(&request.headers)?;

        let now = self.clock.now_utc();
        let secret = generate_secret();
        let webhook = Webhook {
            id: WebhookId::new(),
            url: url.to_string(),
            events,
            description: request.description,
            custom_headers: request.headers,
            is_active: request.is_active.unwrap_or(true),
            created_at: now,
            updated_at: now,
            last_called_at: None,
            active_secret: secret.clone(),
            pending_old_secret: None,
            pending_old_secret_expiry: None,
            security: SecuritySettings::default(),
            deleted_at: None,
        };

        self.store.insert_webhook(webhook.clone()).await?;
        info!(webhook_id = %webhook.id, url = %webhook.url, events = webhook.events.len(), "webhook registered");

        Ok(Registration { webhook, secret })
    }

    /// Fetches a live webhook.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown or deleted ids.
    pub async fn get(&self, id: WebhookId) -> Result<Webhook> {
        match self.store.find_webhook(id).await? {
            Some(webhook) if !webhook.is_deleted() => Ok(webhook),
            _ => Err(CoreError::not_found(format!("webhook {id}"))),
        }
    }

    /// Lists live webhooks, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn list(&self, page: PageRequest) -> Result<Page<Webhook>> {
        self.store.list_webhooks(page).await
    }

    /// Applies a partial update.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for invalid fields and
    /// `CoreError::NotFound` for unknown or deleted ids.
    pub async fn update(&self, id: WebhookId, update: WebhookUpdate) -> Result<Webhook> {
        let url = update
            .url
            .as_deref()
            .map(|raw| validate_url(raw, self.config.allow_insecure_urls))
            .transpose()?;
        let events = update.events.as_deref().map(validate_events).transpose()?;
        if let Some(headers) = &update.headers {
            validate_custom_headers(headers)?;
        }

        self.modify(id, move |webhook| {
            if let Some(url) = url {
                webhook.url = url.to_string();
            }
            if let Some(events) = events {
                webhook.events = events;
            }
            if let Some(description) = update.description {
                webhook.description = Some(description);
            }
            if let Some(headers) = update.headers {
                webhook.custom_headers = headers;
            }
            if let Some(is_active) = update.is_active {
                if webhook.is_active && !is_active {
                    info!(webhook_id = %id, "webhook deactivated; queued retries will be skipped");
                }
                webhook.is_active = is_active;
            }
        })
        .await
    }

    /// Tombstones a webhook. It disappears from reads and dispatch; its
    /// delivery history is kept.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown or already deleted ids.
    pub async fn delete(&self, id: WebhookId) -> Result<()> {
        let now = self.clock.now_utc();
        self.modify(id, move |webhook| {
            webhook.deleted_at = Some(now);
            webhook.is_active = false;
        })
        .await?;
        info!(webhook_id = %id, "webhook deleted");
        Ok(())
    }

    /// Installs a new signing secret and keeps the old one verifiable for
    /// the configured grace period. A rotation during an open grace window
    /// replaces the older pending secret.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown or deleted ids.
    pub async fn rotate_secret(&self, id: WebhookId) -> Result<SecretRotation> {
        let new_secret = generate_secret();
        let old_secret_expiry = self.clock.now_utc() + self.config.rotation_grace;

        let installed = new_secret.clone();
        self.modify(id, move |webhook| {
            let old = std::mem::replace(&mut webhook.active_secret, installed);
            webhook.pending_old_secret = Some(old);
            webhook.pending_old_secret_expiry = Some(old_secret_expiry);
        })
        .await?;
        info!(webhook_id = %id, %old_secret_expiry, "webhook secret rotated");

        Ok(SecretRotation { new_secret, old_secret_expiry })
    }

    /// Replaces the IP allowlist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if any entry is not an IP address or
    /// CIDR block, or if the list is enabled while empty.
    pub async fn configure_allowlist(
        &self,
        id: WebhookId,
        ips: &[String],
        enabled: bool,
    ) -> Result<Webhook> {
        let allowlist = IpAllowlist::parse(ips)?;
        if enabled && allowlist.is_empty() {
            return Err(CoreError::validation("an enabled ip allowlist needs at least one entry"));
        }

        let entries = allowlist.to_strings();
        debug!(webhook_id = %id, entries = entries.len(), enabled, "configuring ip allowlist");
        self.modify(id, move |webhook| {
            webhook.security.ip_allowlist = entries;
            webhook.security.ip_allowlist_enabled = enabled;
        })
        .await
    }

    /// Sets per-webhook rate limits within the operator ceilings.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for zero limits, a per-minute limit
    /// above the per-hour limit, or a limit above its ceiling.
    pub async fn configure_rate_limits(
        &self,
        id: WebhookId,
        per_minute: u32,
        per_hour: u32,
    ) -> Result<Webhook> {
        validate_rate_limits(
            per_minute,
            per_hour,
            self.config.rate_limit_ceiling_per_minute,
            self.config.rate_limit_ceiling_per_hour,
        )?;

        debug!(webhook_id = %id, per_minute, per_hour, "configuring rate limits");
        self.modify(id, move |webhook| {
            webhook.security.rate_limit_per_minute = Some(per_minute);
            webhook.security.rate_limit_per_hour = Some(per_hour);
        })
        .await
    }

    /// Active, non-deleted webhooks subscribed to `event_type`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn subscribers(&self, event_type: EventType) -> Result<Vec<Webhook>> {
        self.store.subscribed_webhooks(event_type).await
    }

    /// Fetches a webhook including tombstoned rows, for delivery-time checks.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn find_any(&self, id: WebhookId) -> Result<Option<Webhook>> {
        self.store.find_webhook(id).await
    }

    /// Records a successful delivery.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn mark_called(&self, id: WebhookId, at: DateTime<Utc>) -> Result<()> {
        self.store.mark_called(id, at).await
    }

    /// Applies `change` to a live webhook as one atomic store update.
    async fn modify<F>(&self, id: WebhookId, change: F) -> Result<Webhook>
    where
        F: FnOnce(&mut Webhook) + Send + 'static,
    {
        let now = self.clock.now_utc();
        self.store
            .modify_webhook(
                id,
                Box::new(move |webhook| {
                    if webhook.is_deleted() {
                        return Err(CoreError::not_found(format!("webhook {id}")));
                    }
                    change(webhook);
                    webhook.updated_at = now;
                    Ok(())
                }),
            )
            .await
    }
}
