//! Domain models and strongly-typed identifiers.
//!
//! Defines webhooks, events and delivery attempts together with the newtype
//! ids that keep them apart at compile time. Secrets are wrapped so they never
//! leak through `Debug` output or serialized API responses.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult = std::result::Result<sqlx::encode::IsNull, sqlx::error::BoxDynError>;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, sqlx::error::BoxDynError> {
                Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id!(
    /// Strongly-typed webhook subscription identifier.
    WebhookId
);

uuid_id!(
    /// Strongly-typed delivery attempt identifier.
    DeliveryId
);

/// Maximum accepted length of a caller-supplied event id.
pub const MAX_EVENT_ID_LEN: usize = 255;

/// Globally unique event identifier supplied by the event producer.
///
/// Receivers use it as their idempotency key, so it is carried verbatim in
/// every delivery of the event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId(String);

impl EventId {
    /// Validates and wraps a producer-supplied id.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for empty, oversized, or
    /// whitespace-containing ids.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(CoreError::validation("event id must not be empty"));
        }
        if raw.len() > MAX_EVENT_ID_LEN {
            return Err(CoreError::validation(format!(
                "event id exceeds {MAX_EVENT_ID_LEN} characters"
            )));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(CoreError::validation("event id must not contain whitespace"));
        }
        Ok(Self(raw))
    }

    /// Generates a fresh `evt_`-prefixed id.
    pub fn generate() -> Self {
        Self(format!("evt_{}", Uuid::new_v4().simple()))
    }

    /// Borrows the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EventId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> Self {
        id.0
    }
}

/// Fixed set of event types a webhook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    /// A user account was created.
    #[serde(rename = "user.created")]
    UserCreated,
    /// A user account was updated.
    #[serde(rename = "user.updated")]
    UserUpdated,
    /// A user account was deleted.
    #[serde(rename = "user.deleted")]
    UserDeleted,
    /// A subscription was started.
    #[serde(rename = "subscription.created")]
    SubscriptionCreated,
    /// A subscription changed plan or quantity.
    #[serde(rename = "subscription.updated")]
    SubscriptionUpdated,
    /// A subscription was cancelled.
    #[serde(rename = "subscription.cancelled")]
    SubscriptionCancelled,
    /// A subscription renewed for another period.
    #[serde(rename = "subscription.renewed")]
    SubscriptionRenewed,
    /// A project was created.
    #[serde(rename = "project.created")]
    ProjectCreated,
    /// A project was updated.
    #[serde(rename = "project.updated")]
    ProjectUpdated,
    /// A project was deleted.
    #[serde(rename = "project.deleted")]
    ProjectDeleted,
    /// A payment settled.
    #[serde(rename = "payment.received")]
    PaymentReceived,
    /// A payment was declined or errored.
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    /// A payment was refunded.
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,
    /// A niche analysis job started.
    #[serde(rename = "niche_analysis.started")]
    NicheAnalysisStarted,
    /// A niche analysis job finished with results.
    #[serde(rename = "niche_analysis.completed")]
    NicheAnalysisCompleted,
    /// A niche analysis job failed.
    #[serde(rename = "niche_analysis.failed")]
    NicheAnalysisFailed,
}

impl EventType {
    /// Every recognized event type.
    pub const ALL: [Self; 16] = [
        Self::UserCreated,
        Self::UserUpdated,
        Self::UserDeleted,
        Self::SubscriptionCreated,
        Self::SubscriptionUpdated,
        Self::SubscriptionCancelled,
        Self::SubscriptionRenewed,
        Self::ProjectCreated,
        Self::ProjectUpdated,
        Self::ProjectDeleted,
        Self::PaymentReceived,
        Self::PaymentFailed,
        Self::PaymentRefunded,
        Self::NicheAnalysisStarted,
        Self::NicheAnalysisCompleted,
        Self::NicheAnalysisFailed,
    ];

    /// Wire name, e.g. `payment.received`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::UserDeleted => "user.deleted",
            Self::SubscriptionCreated => "subscription.created",
            Self::SubscriptionUpdated => "subscription.updated",
            Self::SubscriptionCancelled => "subscription.cancelled",
            Self::SubscriptionRenewed => "subscription.renewed",
            Self::ProjectCreated => "project.created",
            Self::ProjectUpdated => "project.updated",
            Self::ProjectDeleted => "project.deleted",
            Self::PaymentReceived => "payment.received",
            Self::PaymentFailed => "payment.failed",
            Self::PaymentRefunded => "payment.refunded",
            Self::NicheAnalysisStarted => "niche_analysis.started",
            Self::NicheAnalysisCompleted => "niche_analysis.completed",
            Self::NicheAnalysisFailed => "niche_analysis.failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| CoreError::validation(format!("unrecognized event type: {s}")))
    }
}

/// An immutable fact raised by an upstream producer.
///
/// Field order is the canonical wire order: `{id, type, created_at, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Idempotency key for receivers.
    pub id: EventId,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// When the producer raised the event.
    pub created_at: DateTime<Utc>,
    /// Type-specific payload.
    pub data: serde_json::Value,
}

impl Event {
    /// Serializes the event to the exact bytes that are signed and sent.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if the payload cannot be serialized.
    pub fn canonical_body(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// HMAC signing secret for a webhook.
///
/// `Debug` is redacted; the raw value is only reachable through `expose`.
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookSecret(String);

impl WebhookSecret {
    /// Wraps an existing secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw secret value. Only registration and rotation responses use this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Secret bytes used as the HMAC key.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret(***)")
    }
}

/// Security options attached to a webhook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Allowed destination addresses, as IPs or CIDR blocks.
    pub ip_allowlist: Vec<String>,
    /// Whether the allowlist is checked at delivery time.
    pub ip_allowlist_enabled: bool,
    /// Per-minute delivery cap; system default when unset.
    pub rate_limit_per_minute: Option<u32>,
    /// Per-hour delivery cap; system default when unset.
    pub rate_limit_per_hour: Option<u32>,
}

/// A webhook subscription.
#[derive(Debug, Clone, Serialize)]
pub struct Webhook {
    /// Unique identifier.
    pub id: WebhookId,
    /// HTTPS destination.
    pub url: String,
    /// Subscribed event types. Never empty while active.
    pub events: BTreeSet<EventType>,
    /// Free-form operator description.
    pub description: Option<String>,
    /// Extra headers sent with every delivery.
    pub custom_headers: BTreeMap<String, String>,
    /// Inactive webhooks receive no new deliveries and their queued retries
    /// are skipped.
    pub is_active: bool,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Time of the last successful delivery.
    pub last_called_at: Option<DateTime<Utc>>,
    /// Current signing secret.
    #[serde(skip)]
    pub active_secret: WebhookSecret,
    /// Previous secret, valid for verification until its expiry.
    #[serde(skip)]
    pub pending_old_secret: Option<WebhookSecret>,
    /// End of the rotation grace window.
    pub pending_old_secret_expiry: Option<DateTime<Utc>>,
    /// Allowlist and rate-limit settings.
    #[serde(flatten)]
    pub security: SecuritySettings,
    /// Tombstone; deleted webhooks are invisible to reads and dispatch.
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Webhook {
    /// Whether the webhook has been tombstoned.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether an event of `event_type` should be dispatched here.
    pub fn accepts(&self, event_type: EventType) -> bool {
        self.is_active && !self.is_deleted() && self.events.contains(&event_type)
    }

    /// Secrets a receiver should accept at `now`: the active secret, plus the
    /// previous one while its grace window is open.
    pub fn verification_secrets(&self, now: DateTime<Utc>) -> Vec<&WebhookSecret> {
        let mut secrets = vec![&self.active_secret];
        if let (Some(old), Some(expiry)) = (&self.pending_old_secret, self.pending_old_secret_expiry)
        {
            if now < expiry {
                secrets.push(old);
            }
        }
        secrets
    }
}

/// Lifecycle state of a delivery attempt row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, not yet executed.
    Pending,
    /// Receiver answered 2xx.
    Success,
    /// Failed with no further retry.
    Failed,
    /// Failed; the next attempt is scheduled at `next_retry_at`.
    Retrying,
    /// Failed on the final permitted attempt.
    MaxRetriesExceeded,
}

impl DeliveryStatus {
    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }

    /// Rows in a terminal state are never updated again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::MaxRetriesExceeded)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            "max_retries_exceeded" => Ok(Self::MaxRetriesExceeded),
            other => Err(CoreError::validation(format!("unknown delivery status: {other}"))),
        }
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptErrorKind {
    /// Denied by the per-webhook rate limiter.
    RateLimited,
    /// Connection, DNS, TLS or allowlist failure.
    Transport,
    /// No response within the delivery timeout.
    Timeout,
    /// Receiver answered with a non-2xx status.
    Receiver,
    /// The payload could not be signed.
    Signing,
    /// Skipped because the webhook was deactivated or deleted.
    Cancelled,
}

impl AttemptErrorKind {
    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Receiver => "receiver",
            Self::Signing => "signing",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AttemptErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptErrorKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rate_limited" => Ok(Self::RateLimited),
            "transport" => Ok(Self::Transport),
            "timeout" => Ok(Self::Timeout),
            "receiver" => Ok(Self::Receiver),
            "signing" => Ok(Self::Signing),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CoreError::validation(format!("unknown error kind: {other}"))),
        }
    }
}

/// One HTTP try for one (event, webhook) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Unique identifier.
    pub id: DeliveryId,
    /// Target webhook.
    pub webhook_id: WebhookId,
    /// Delivered event.
    pub event_id: EventId,
    /// Type of the delivered event.
    pub event_type: EventType,
    /// 1-based, strictly increasing per pair.
    pub attempt_number: u32,
    /// Destination at the time of the attempt.
    pub request_url: String,
    /// Headers sent, including the signature. Never contains the secret.
    pub request_headers: BTreeMap<String, String>,
    /// Canonical JSON body, byte-for-byte what was signed.
    pub request_body: String,
    /// Receiver status code, when one was received.
    pub response_code: Option<u16>,
    /// Truncated receiver body.
    pub response_body_excerpt: Option<String>,
    /// Failure description.
    pub error_message: Option<String>,
    /// Failure classification.
    pub error_kind: Option<AttemptErrorKind>,
    /// Current state.
    pub status: DeliveryStatus,
    /// Earliest time the attempt may execute.
    pub scheduled_at: DateTime<Utc>,
    /// Time of the last state change.
    pub timestamp: DateTime<Utc>,
    /// When the follow-up attempt fires; set only while `Retrying`.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
    /// Builds a new `pending` attempt due at `scheduled_at`.
    pub fn pending(
        webhook: &Webhook,
        event_id: EventId,
        event_type: EventType,
        attempt_number: u32,
        request_body: String,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            webhook_id: webhook.id,
            event_id,
            event_type,
            attempt_number,
            request_url: webhook.url.clone(),
            request_headers: BTreeMap::new(),
            request_body,
            response_code: None,
            response_body_excerpt: None,
            error_message: None,
            error_kind: None,
            status: DeliveryStatus::Pending,
            scheduled_at,
            timestamp: now,
            next_retry_at: None,
        }
    }
}

/// Default page size for list queries.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page size list queries accept.
pub const MAX_PAGE_SIZE: u32 = 100;

/// 1-based pagination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Page number, starting at 1.
    pub page: u32,
    /// Items per page.
    pub page_size: u32,
}

impl PageRequest {
    /// Clamps raw query values into a valid request.
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Number of rows to skip.
    pub fn offset(self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of a list query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Page number, starting at 1.
    pub page: u32,
    /// Requested page size.
    pub page_size: u32,
    /// Total matching items across all pages.
    pub total: u64,
}

impl<T> Page<T> {
    /// Slices an already-filtered, already-ordered collection.
    pub fn from_all(all: Vec<T>, request: PageRequest) -> Self {
        let total = all.len() as u64;
        let offset = usize::try_from(request.offset()).unwrap_or(usize::MAX);
        let items = all.into_iter().skip(offset).take(request.page_size as usize).collect();
        Self { items, page: request.page, page_size: request.page_size, total }
    }
}
