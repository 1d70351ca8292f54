//! Core domain model for courier webhook delivery.
//!
//! Provides strongly-typed identifiers, the webhook/event/attempt model,
//! payload signing, input validation, the webhook registry, and the storage
//! seams shared by the delivery engine and the management API.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod allowlist;
pub mod error;
pub mod events;
pub mod models;
pub mod registry;
pub mod signing;
pub mod storage;
pub mod time;
pub mod validation;

pub use error::{CoreError, Result};
pub use events::{
    DeliveryEvent, DeliveryExhaustedEvent, DeliveryFailedEvent, DeliverySucceededEvent,
    EventHandler, MulticastEventHandler, NoOpEventHandler, TracingEventHandler,
};
pub use models::{
    AttemptErrorKind, DeliveryAttempt, DeliveryId, DeliveryStatus, Event, EventId, EventType,
    Page, PageRequest, SecuritySettings, Webhook, WebhookId, WebhookSecret,
};
pub use registry::{RegistryConfig, WebhookRegistry};
pub use storage::{DeliveryStore, WebhookStore};
pub use time::{Clock, RealClock, TestClock};
