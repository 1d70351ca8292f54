//! Shared handler state.

use std::{fmt, sync::Arc};

use courier_core::{Clock, DeliveryStore, WebhookRegistry};
use courier_delivery::{DeliveryEngine, DeliveryProbe, Dispatcher};

/// Handles every route needs, cloned per request.
#[derive(Clone)]
pub struct AppState {
    /// Webhook CRUD and security settings.
    pub registry: WebhookRegistry,
    /// Events and delivery attempts.
    pub store: Arc<dyn DeliveryStore>,
    /// Entry point for newly raised events.
    pub dispatcher: Dispatcher,
    /// One-shot test deliveries.
    pub probe: DeliveryProbe,
    /// Time source for health responses.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Builds state sharing the engine's dispatcher and probe, so events
    /// accepted over HTTP land on the engine's queue.
    pub fn from_engine(
        engine: &DeliveryEngine,
        registry: WebhookRegistry,
        store: Arc<dyn DeliveryStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { registry, store, dispatcher: engine.dispatcher(), probe: engine.probe(), clock }
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher)
            .field("probe", &self.probe)
            .finish_non_exhaustive()
    }
}
