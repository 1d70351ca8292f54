//! One-off test deliveries for receiver onboarding.
//!
//! A probe bypasses the registry: it builds a synthetic event, signs it
//! with a throwaway secret, POSTs it once, and reports the outcome without
//! persisting anything or retrying.

use std::{collections::BTreeMap, sync::Arc};

use courier_core::{
    signing, validation, AttemptErrorKind, Clock, DeliveryId, DeliveryStatus, Event, EventId,
    EventType,
};
use serde::Serialize;
use tracing::{info, instrument};

use crate::{
    client::{signed_headers, DeliveryClient, DeliveryRequest},
    error::{DeliveryError, Result},
};

/// Outcome of a single test delivery.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    /// `success` for a 2xx answer, `failed` otherwise.
    pub status: DeliveryStatus,
    /// Destination that was called.
    pub request_url: String,
    /// Headers sent, signature included.
    pub request_headers: BTreeMap<String, String>,
    /// Exact body that was signed and sent.
    pub request_body: String,
    /// Receiver status code, when one was received.
    pub response_code: Option<u16>,
    /// Truncated receiver body.
    pub response_body_excerpt: Option<String>,
    /// Failure classification.
    pub error_kind: Option<AttemptErrorKind>,
    /// Failure description.
    pub error_message: Option<String>,
    /// Round-trip time in milliseconds.
    pub duration_ms: u64,
    /// Throwaway secret the payload was signed with, so the receiver's
    /// verification code can be checked against it.
    pub signing_secret: String,
}

/// Runs synchronous test deliveries.
#[derive(Debug, Clone)]
pub struct DeliveryProbe {
    client: Arc<DeliveryClient>,
    clock: Arc<dyn Clock>,
    allow_insecure_urls: bool,
}

impl DeliveryProbe {
    /// Creates a probe sharing the engine's HTTP client.
    pub fn new(client: Arc<DeliveryClient>, clock: Arc<dyn Clock>, allow_insecure_urls: bool) -> Self {
        Self { client, clock, allow_insecure_urls }
    }

    /// Sends one signed test event of `event_type` to `url`.
    ///
    /// Receiver and transport failures are reported in the result, not as
    /// errors.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` wrapping a validation error for an
    /// unacceptable URL, or `DeliveryError::Signing` if the payload cannot
    /// be signed.
    #[instrument(skip(self), fields(event_type = %event_type))]
    pub async fn run(&self, url: &str, event_type: EventType) -> Result<ProbeResult> {
        let url = validation::validate_url(url, self.allow_insecure_urls)?.to_string();

        let event = Event {
            id: EventId::generate(),
            event_type,
            created_at: self.clock.now_utc(),
            data: serde_json::json!({
                "test": true,
                "message": format!("courier test delivery for {event_type}"),
            }),
        };
        let body = event.canonical_body()?;
        let secret = signing::generate_secret();
        let signature =
            signing::sign(&secret, &body).map_err(|e| DeliveryError::signing(e.to_string()))?;
        let headers = signed_headers(&BTreeMap::new(), &event.id, event_type, 1, signature);

        let request = DeliveryRequest {
            delivery_id: DeliveryId::new(),
            event_id: event.id.clone(),
            url: url.clone(),
            headers: headers.clone(),
            body: body.clone(),
            attempt_number: 1,
        };

        let start = self.clock.now();
        let outcome = self.client.deliver(request).await;
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut result = ProbeResult {
            status: DeliveryStatus::Failed,
            request_url: url,
            request_headers: headers,
            request_body: String::from_utf8_lossy(&body).into_owned(),
            response_code: None,
            response_body_excerpt: None,
            error_kind: None,
            error_message: None,
            duration_ms,
            signing_secret: secret.expose().to_string(),
        };

        match outcome {
            Ok(response) => {
                result.response_code = Some(response.status_code);
                result.response_body_excerpt = Some(response.body_excerpt);
                if response.is_success {
                    result.status = DeliveryStatus::Success;
                } else {
                    let error = DeliveryError::receiver(response.status_code, "");
                    result.error_kind = error.attempt_error_kind();
                    result.error_message = Some(error.to_string());
                }
            },
            Err(error) => {
                result.error_kind = error.attempt_error_kind();
                result.error_message = Some(error.to_string());
            },
        }

        info!(
            url = %result.request_url,
            status = %result.status,
            response_code = ?result.response_code,
            "test delivery finished"
        );
        Ok(result)
    }
}
