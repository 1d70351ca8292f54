//! Delivery history queries.

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use courier_core::{
    CoreError, DeliveryAttempt, DeliveryId, DeliveryStatus, Page, PageRequest, WebhookId,
};
use serde::Deserialize;
use tracing::instrument;

use super::parse_id;
use crate::{error::ApiResult, state::AppState};

/// Query parameters of `GET /webhooks/{id}/deliveries`.
#[derive(Debug, Default, Deserialize)]
pub struct DeliveryFilter {
    /// Only attempts in this status.
    pub status: Option<String>,
    /// 1-based page number.
    pub page: Option<u32>,
    /// Rows per page.
    pub page_size: Option<u32>,
}

/// Lists a webhook's attempts, newest first.
///
/// History of a deleted webhook stays readable.
#[instrument(name = "list_deliveries", skip(state, params))]
pub async fn list_deliveries(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Result<Query<DeliveryFilter>, QueryRejection>,
) -> ApiResult<Json<Page<DeliveryAttempt>>> {
    let id: WebhookId = parse_id(&id, "webhook")?;
    let Query(filter) = params?;
    let status = filter.status.as_deref().map(str::parse::<DeliveryStatus>).transpose()?;

    if state.registry.find_any(id).await?.is_none() {
        return Err(CoreError::not_found(format!("webhook {id}")).into());
    }

    let page = PageRequest::new(filter.page, filter.page_size);
    Ok(Json(state.store.list_attempts(id, status, page).await?))
}

/// Fetches one attempt.
#[instrument(name = "get_delivery", skip(state))]
pub async fn get_delivery(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeliveryAttempt>> {
    let id: DeliveryId = parse_id(&id, "delivery")?;
    let attempt = state
        .store
        .find_attempt(id)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("delivery attempt {id}")))?;
    Ok(Json(attempt))
}
