//! Event ingestion and lookup.
//!
//! Producers raise events here; each accepted event is recorded once and
//! fanned out to every active subscriber by the dispatcher.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::{Clock, CoreError, Event, EventId, EventType};
use courier_delivery::DispatchReport;
use serde::Deserialize;
use tracing::{info, instrument};

use crate::{error::ApiResult, state::AppState};

/// Body of `POST /events`.
#[derive(Debug, Deserialize)]
pub struct IngestEventRequest {
    /// Producer-assigned idempotency key.
    pub id: String,
    /// Event type name, e.g. `payment.received`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Defaults to the time of ingestion.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Type-specific payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Accepts an event for delivery.
///
/// Returns `202` with the attempts created. Re-posting a known id creates
/// nothing new.
#[instrument(name = "ingest_event", skip_all)]
pub async fn ingest_event(
    State(state): State<AppState>,
    payload: Result<Json<IngestEventRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<DispatchReport>)> {
    let Json(request) = payload?;
    let event = Event {
        id: EventId::parse(request.id)?,
        event_type: request.event_type.parse::<EventType>()?,
        created_at: request.created_at.unwrap_or_else(|| state.clock.now_utc()),
        data: request.data,
    };

    let report = state.dispatcher.dispatch(event).await?;
    info!(
        event_id = %report.event_id,
        first_seen = report.first_seen,
        attempts = report.attempts.len(),
        "event accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(report)))
}

/// Fetches a recorded event.
#[instrument(name = "get_event", skip(state))]
pub async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Event>> {
    let id = EventId::parse(id)?;
    let event = state
        .store
        .find_event(id.clone())
        .await?
        .ok_or_else(|| CoreError::not_found(format!("event {id}")))?;
    Ok(Json(event))
}
