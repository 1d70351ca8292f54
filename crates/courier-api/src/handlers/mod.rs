//! HTTP request handlers for the courier API.
//!
//! Handlers are grouped by functionality:
//! - `webhooks` - registration, CRUD and test deliveries
//! - `security` - IP allowlist, secret rotation and rate limits
//! - `deliveries` - delivery history
//! - `events` - event ingestion and lookup
//! - `health` - health check and readiness probes
//!
//! Every handler returns [`ApiResult`], so failures share one JSON error
//! envelope, including malformed ids and bodies rejected by extractors.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

pub mod deliveries;
pub mod events;
pub mod health;
pub mod security;
pub mod webhooks;

pub use deliveries::{get_delivery, list_deliveries};
pub use events::{get_event, ingest_event};
pub use health::{health_check, liveness_check, readiness_check};
pub use security::{configure_allowlist, configure_rate_limits, rotate_secret};
pub use webhooks::{
    create_webhook, delete_webhook, get_webhook, list_webhooks, test_webhook, update_webhook,
};

/// `page` and `page_size` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    /// 1-based page number.
    pub page: Option<u32>,
    /// Rows per page.
    pub page_size: Option<u32>,
}

pub(crate) fn parse_id<T: From<Uuid>>(raw: &str, what: &str) -> ApiResult<T> {
    Uuid::parse_str(raw)
        .map(T::from)
        .map_err(|_| ApiError::bad_request(format!("invalid {what} id: {raw}")))
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}
