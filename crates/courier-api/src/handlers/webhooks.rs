//! Webhook registration, CRUD and test deliveries.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use courier_core::{
    registry::{NewWebhook, WebhookUpdate},
    EventType, Page, PageRequest, Webhook, WebhookId,
};
use courier_delivery::ProbeResult;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::{parse_id, PageParams};
use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Registration response: the stored webhook plus its secret, shown once.
#[derive(Debug, Serialize)]
pub struct CreatedWebhook {
    /// The stored webhook.
    #[serde(flatten)]
    pub webhook: Webhook,
    /// Signing secret. Never returned again.
    pub secret: String,
}

/// Body of `POST /webhooks/test`.
#[derive(Debug, Deserialize)]
pub struct TestDeliveryRequest {
    /// Destination to probe.
    pub url: String,
    /// Event type of the synthetic event.
    pub event_type: String,
}

/// Registers a webhook and returns its secret once.
#[instrument(name = "create_webhook", skip_all)]
pub async fn create_webhook(
    State(state): State<AppState>,
    payload: Result<Json<NewWebhook>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreatedWebhook>)> {
    let Json(request) = payload?;
    let registration = state.registry.register(request).await?;

    info!(webhook_id = %registration.webhook.id, "webhook registered over api");
    Ok((
        StatusCode::CREATED,
        Json(CreatedWebhook {
            webhook: registration.webhook,
            secret: registration.secret.expose().to_string(),
        }),
    ))
}

/// Lists live webhooks, oldest first.
#[instrument(name = "list_webhooks", skip_all)]
pub async fn list_webhooks(
    State(state): State<AppState>,
    params: Result<Query<PageParams>, QueryRejection>,
) -> ApiResult<Json<Page<Webhook>>> {
    let Query(params) = params?;
    let page = PageRequest::new(params.page, params.page_size);
    Ok(Json(state.registry.list(page).await?))
}

/// Fetches one live webhook.
#[instrument(name = "get_webhook", skip(state))]
pub async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Webhook>> {
    let id: WebhookId = parse_id(&id, "webhook")?;
    Ok(Json(state.registry.get(id).await?))
}

/// Applies a partial update.
#[instrument(name = "update_webhook", skip(state, payload))]
pub async fn update_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<WebhookUpdate>, JsonRejection>,
) -> ApiResult<Json<Webhook>> {
    let id: WebhookId = parse_id(&id, "webhook")?;
    let Json(update) = payload?;
    Ok(Json(state.registry.update(id, update).await?))
}

/// Tombstones a webhook. Its delivery history stays queryable.
#[instrument(name = "delete_webhook", skip(state))]
pub async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id: WebhookId = parse_id(&id, "webhook")?;
    state.registry.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Sends one synthetic event to a URL and reports the outcome.
///
/// Receiver failures are part of a `200` response; only an unacceptable URL
/// or event type is an error.
#[instrument(name = "test_webhook", skip_all)]
pub async fn test_webhook(
    State(state): State<AppState>,
    payload: Result<Json<TestDeliveryRequest>, JsonRejection>,
) -> ApiResult<Json<ProbeResult>> {
    let Json(request) = payload?;
    let event_type: EventType = request.event_type.parse()?;
    let result = state.probe.run(&request.url, event_type).await.map_err(ApiError::from)?;
    Ok(Json(result))
}
