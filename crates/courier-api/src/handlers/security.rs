//! Per-webhook security settings: IP allowlist, secret rotation and rate
//! limits.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::{Webhook, WebhookId};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::parse_id;
use crate::{error::ApiResult, state::AppState};

/// Body of `PUT /webhooks/{id}/security/ip-allowlist`.
#[derive(Debug, Deserialize)]
pub struct AllowlistRequest {
    /// IP addresses or CIDR blocks.
    #[serde(default)]
    pub ips: Vec<String>,
    /// Whether deliveries check the list.
    pub enabled: bool,
}

/// Body of `PUT /webhooks/{id}/security/rate-limits`.
#[derive(Debug, Deserialize)]
pub struct RateLimitsRequest {
    /// Deliveries allowed per rolling minute.
    pub per_minute: u32,
    /// Deliveries allowed per rolling hour.
    pub per_hour: u32,
}

/// Result of a secret rotation.
#[derive(Debug, Serialize)]
pub struct RotationResponse {
    /// The new signing secret. Never returned again.
    pub new_secret: String,
    /// When the previous secret stops verifying.
    pub old_secret_expiry: DateTime<Utc>,
}

/// Replaces the webhook's IP allowlist.
#[instrument(name = "configure_allowlist", skip(state, payload))]
pub async fn configure_allowlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<AllowlistRequest>, JsonRejection>,
) -> ApiResult<Json<Webhook>> {
    let id: WebhookId = parse_id(&id, "webhook")?;
    let Json(request) = payload?;
    let webhook = state.registry.configure_allowlist(id, &request.ips, request.enabled).await?;
    Ok(Json(webhook))
}

/// Rotates the signing secret.
#[instrument(name = "rotate_secret", skip(state))]
pub async fn rotate_secret(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RotationResponse>> {
    let id: WebhookId = parse_id(&id, "webhook")?;
    let rotation = state.registry.rotate_secret(id).await?;
    Ok(Json(RotationResponse {
        new_secret: rotation.new_secret.expose().to_string(),
        old_secret_expiry: rotation.old_secret_expiry,
    }))
}

/// Sets per-webhook rate limits within the operator ceilings.
#[instrument(name = "configure_rate_limits", skip(state, payload))]
pub async fn configure_rate_limits(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<RateLimitsRequest>, JsonRejection>,
) -> ApiResult<Json<Webhook>> {
    let id: WebhookId = parse_id(&id, "webhook")?;
    let Json(request) = payload?;
    let webhook =
        state.registry.configure_rate_limits(id, request.per_minute, request.per_hour).await?;
    Ok(Json(webhook))
}
