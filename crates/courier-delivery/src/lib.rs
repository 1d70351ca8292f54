//! Webhook delivery engine with at-least-once guarantees.
//!
//! This crate turns dispatched events into signed HTTP POSTs and drives each
//! (webhook, event) pair through a fixed retry schedule until it succeeds or
//! runs out of attempts.
//!
//! # Architecture
//!
//! 1. **Dispatch** - the `Dispatcher` records the event and inserts one
//!    pending attempt per active subscriber
//! 2. **Queue** - attempts wait in a delayed queue ordered by due time
//! 3. **Execute** - a worker takes the pair lock, consults the rate limiter,
//!    signs the stored body, and POSTs it with a hard timeout
//! 4. **Record** - the outcome is stored on the attempt row; a failed
//!    attempt's follow-up is inserted and queued only afterwards
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{storage::InMemoryStore, RealClock, RegistryConfig, WebhookRegistry};
//! use courier_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//!
//! # async fn example() -> Result<(), DeliveryError> {
//! let store = InMemoryStore::new();
//! let clock = Arc::new(RealClock::new());
//! let registry = WebhookRegistry::new(Arc::new(store.clone()), clock.clone(), RegistryConfig::default());
//! let mut engine = DeliveryEngine::new(registry, Arc::new(store), DeliveryConfig::default(), clock)?;
//!
//! engine.recover_pending().await?;
//! engine.start().await?;
//! // ...
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod probe;
pub mod queue;
pub mod rate_limit;
pub mod retry;
mod worker;
mod worker_pool;

pub use client::{ClientConfig, DeliveryClient};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::{DeliveryError, Result};
pub use probe::{DeliveryProbe, ProbeResult};
pub use rate_limit::{InMemoryRateWindows, RateLimiter, RateLimits, RateWindowStore};
pub use retry::RetryPolicy;
pub use worker::{DeliveryConfig, DeliveryEngine, EngineStats};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default upper bound on how long an idle worker sleeps.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
