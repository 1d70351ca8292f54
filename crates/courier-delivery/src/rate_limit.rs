//! Per-webhook sliding-window rate limiting.
//!
//! Each webhook has two windows: 60 one-second buckets and 60 one-minute
//! buckets. An acquisition is allowed only if both windows are below their
//! limits, and then increments both under one lock. Window state lives
//! behind `RateWindowStore` so it can move to a shared counter store
//! without touching the limiter.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use courier_core::{Clock, Webhook, WebhookId};
use tracing::debug;

const BUCKETS: usize = 60;

/// Limits applied to one webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    /// Deliveries allowed in any 60-second window.
    pub per_minute: u32,
    /// Deliveries allowed in any 3600-second window.
    pub per_hour: u32,
}

impl RateLimits {
    /// System defaults: 100 per minute, 1000 per hour.
    pub const DEFAULT: Self = Self { per_minute: 100, per_hour: 1000 };

    /// Webhook-configured limits, falling back to `defaults` per field.
    pub fn for_webhook(webhook: &Webhook, defaults: Self) -> Self {
        Self {
            per_minute: webhook.security.rate_limit_per_minute.unwrap_or(defaults.per_minute),
            per_hour: webhook.security.rate_limit_per_hour.unwrap_or(defaults.per_hour),
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Storage for rate windows.
///
/// `try_acquire` must check and increment atomically with respect to
/// concurrent callers for the same webhook.
pub trait RateWindowStore: Send + Sync + fmt::Debug {
    /// Records one delivery for `webhook_id` if both windows have room.
    fn try_acquire(&self, webhook_id: WebhookId, limits: RateLimits, now: DateTime<Utc>) -> bool;

    /// Drops all state for a webhook.
    fn forget(&self, webhook_id: WebhookId);
}

/// Circular bucket counter covering `BUCKETS * width_secs` seconds.
#[derive(Debug, Clone)]
struct SlidingWindow {
    buckets: [u32; BUCKETS],
    width_secs: i64,
    last_slot: i64,
    total: u64,
}

impl SlidingWindow {
    fn new(width_secs: i64, now_secs: i64) -> Self {
        Self { buckets: [0; BUCKETS], width_secs, last_slot: now_secs.div_euclid(width_secs), total: 0 }
    }

    /// Clears buckets that fell out of the window. A clock that moved
    /// backwards keeps counting into the newest bucket.
    fn advance(&mut self, now_secs: i64) {
        let slot = now_secs.div_euclid(self.width_secs);
        if slot <= self.last_slot {
            return;
        }

        let stale = (slot - self.last_slot).min(BUCKETS as i64);
        for step in 1..=stale {
            let index = bucket_index(self.last_slot + step);
            self.total -= u64::from(self.buckets[index]);
            self.buckets[index] = 0;
        }
        self.last_slot = slot;
    }

    fn count(&self) -> u64 {
        self.total
    }

    fn record(&mut self) {
        let index = bucket_index(self.last_slot);
        self.buckets[index] = self.buckets[index].saturating_add(1);
        self.total += 1;
    }
}

fn bucket_index(slot: i64) -> usize {
    // rem_euclid keeps the value in 0..BUCKETS
    usize::try_from(slot.rem_euclid(BUCKETS as i64)).unwrap_or(0)
}

#[derive(Debug, Clone)]
struct WebhookWindows {
    minute: SlidingWindow,
    hour: SlidingWindow,
}

/// Process-local `RateWindowStore`.
#[derive(Debug, Default)]
pub struct InMemoryRateWindows {
    windows: Mutex<HashMap<WebhookId, WebhookWindows>>,
}

impl InMemoryRateWindows {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of webhooks with live window state.
    pub fn tracked_webhooks(&self) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl RateWindowStore for InMemoryRateWindows {
    fn try_acquire(&self, webhook_id: WebhookId, limits: RateLimits, now: DateTime<Utc>) -> bool {
        let now_secs = now.timestamp();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = windows.entry(webhook_id).or_insert_with(|| WebhookWindows {
            minute: SlidingWindow::new(1, now_secs),
            hour: SlidingWindow::new(60, now_secs),
        });

        entry.minute.advance(now_secs);
        entry.hour.advance(now_secs);

        if entry.minute.count() >= u64::from(limits.per_minute)
            || entry.hour.count() >= u64::from(limits.per_hour)
        {
            return false;
        }

        entry.minute.record();
        entry.hour.record();
        true
    }

    fn forget(&self, webhook_id: WebhookId) {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).remove(&webhook_id);
    }
}

/// Gatekeeper consulted before every delivery attempt.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateWindowStore>,
    clock: Arc<dyn Clock>,
    defaults: RateLimits,
}

impl RateLimiter {
    /// Creates a limiter over `store`.
    pub fn new(store: Arc<dyn RateWindowStore>, clock: Arc<dyn Clock>, defaults: RateLimits) -> Self {
        Self { store, clock, defaults }
    }

    /// Limiter with an in-memory store.
    pub fn in_memory(clock: Arc<dyn Clock>, defaults: RateLimits) -> Self {
        Self::new(Arc::new(InMemoryRateWindows::new()), clock, defaults)
    }

    /// Limits applied to `webhook`.
    pub fn limits_for(&self, webhook: &Webhook) -> RateLimits {
        RateLimits::for_webhook(webhook, self.defaults)
    }

    /// Consumes one slot for `webhook`, or returns `false` when either
    /// window is full.
    pub fn try_acquire(&self, webhook: &Webhook) -> bool {
        let limits = self.limits_for(webhook);
        let allowed = self.store.try_acquire(webhook.id, limits, self.clock.now_utc());
        if !allowed {
            debug!(
                webhook_id = %webhook.id,
                per_minute = limits.per_minute,
                per_hour = limits.per_hour,
                "rate limit denied delivery"
            );
        }
        allowed
    }

    /// Drops window state for a webhook.
    pub fn forget(&self, webhook_id: WebhookId) {
        self.store.forget(webhook_id);
    }
}
