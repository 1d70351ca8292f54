//! HTTP client for webhook delivery with a hard total timeout.
//!
//! The client only transports bytes: it never re-serializes the body, and
//! it returns every HTTP response, 2xx or not, for the worker to classify.
//! Connection failures and timeouts come back as errors.

use std::{collections::BTreeMap, net::IpAddr, time::Duration};

use bytes::Bytes;
use courier_core::{
    signing::SIGNATURE_HEADER, validation::RESERVED_HEADERS, DeliveryId, EventId, EventType,
};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Longest response body excerpt kept on an attempt row.
pub const MAX_EXCERPT_BYTES: usize = 1024;

/// Default total request timeout.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the event id.
pub const EVENT_ID_HEADER: &str = "X-Webhook-Event-Id";

/// Header carrying the event type.
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event-Type";

/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Total timeout covering connect, send, and response.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DELIVERY_TIMEOUT,
            user_agent: concat!("courier-webhooks/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 0,
        }
    }
}

/// HTTP client shared by all delivery workers.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One outbound webhook POST.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Attempt row being executed.
    pub delivery_id: DeliveryId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Destination URL.
    pub url: String,
    /// Complete header set, signature included.
    pub headers: BTreeMap<String, String>,
    /// Signed body bytes.
    pub body: Bytes,
    /// Attempt number for this delivery.
    pub attempt_number: u32,
}

/// Response from a webhook delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated to `MAX_EXCERPT_BYTES`.
    pub body_excerpt: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let redirect = match config.max_redirects {
            0 => reqwest::redirect::Policy::none(),
            n => reqwest::redirect::Policy::limited(n as usize),
        };
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(redirect)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// See [`DeliveryClient::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Configured total timeout.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// POSTs the signed payload.
    ///
    /// # Errors
    ///
    /// - `Timeout` when no response arrives within the configured timeout
    /// - `Transport` for connection, DNS, or TLS failures
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_delivery",
            event_id = %request.event_id,
            delivery_id = %request.delivery_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("sending webhook");

            let mut http_request = self.client.post(&request.url).body(request.body.clone());
            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), error = %e, "request failed");

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::transport(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::transport(e.to_string()));
                },
            };

            let delivery_response = read_response(response, start_time).await?;

            if delivery_response.is_success {
                tracing::debug!(
                    status = delivery_response.status_code,
                    duration_ms = delivery_response.duration.as_millis(),
                    "receiver accepted webhook"
                );
            } else {
                tracing::warn!(
                    status = delivery_response.status_code,
                    duration_ms = delivery_response.duration.as_millis(),
                    "receiver rejected webhook"
                );
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }
}

async fn read_response(
    response: Response,
    start_time: std::time::Instant,
) -> Result<DeliveryResponse> {
    let status = response.status();

    let body_excerpt = match response.bytes().await {
        Ok(bytes) => excerpt(&bytes),
        Err(e) if e.is_timeout() => {
            return Err(DeliveryError::transport(format!("timed out reading response body: {e}")));
        },
        Err(e) => {
            tracing::warn!(error = %e, "failed to read response body");
            format!("[failed to read response body: {e}]")
        },
    };

    Ok(DeliveryResponse {
        status_code: status.as_u16(),
        body_excerpt,
        duration: start_time.elapsed(),
        is_success: status.is_success(),
    })
}

/// Full header set for a signed delivery.
///
/// Custom headers go first so the reserved headers always win, even if a
/// stored custom header predates the reserved-name check.
pub fn signed_headers(
    custom_headers: &BTreeMap<String, String>,
    event_id: &EventId,
    event_type: EventType,
    attempt_number: u32,
    signature: String,
) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = custom_headers
        .iter()
        .filter(|(name, _)| !is_reserved(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers.insert(SIGNATURE_HEADER.to_string(), signature);
    headers.insert(EVENT_ID_HEADER.to_string(), event_id.to_string());
    headers.insert(EVENT_TYPE_HEADER.to_string(), event_type.to_string());
    headers.insert(ATTEMPT_HEADER.to_string(), attempt_number.to_string());
    headers
}

fn is_reserved(name: &str) -> bool {
    RESERVED_HEADERS.iter().any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// Lossy UTF-8 prefix of `bytes`, at most `MAX_EXCERPT_BYTES` long.
pub fn excerpt(bytes: &[u8]) -> String {
    const SUFFIX: &str = "... (truncated)";

    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_EXCERPT_BYTES {
        return text.into_owned();
    }

    let mut end = MAX_EXCERPT_BYTES - SUFFIX.len();
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{SUFFIX}", &text[..end])
}

/// Resolves the addresses a delivery to `url` would connect to.
///
/// # Errors
///
/// Returns `DeliveryError::Transport` if the URL has no host or the lookup
/// fails.
pub async fn resolve_destination(url: &str) -> Result<Vec<IpAddr>> {
    let parsed =
        url::Url::parse(url).map_err(|e| DeliveryError::transport(format!("invalid url: {e}")))?;
    let host = parsed.host().ok_or_else(|| DeliveryError::transport("url has no host"))?;
    let port = parsed.port_or_known_default().unwrap_or(443);

    match host {
        url::Host::Ipv4(addr) => Ok(vec![IpAddr::V4(addr)]),
        url::Host::Ipv6(addr) => Ok(vec![IpAddr::V6(addr)]),
        url::Host::Domain(domain) => {
            let addrs = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| DeliveryError::transport(format!("dns lookup for {domain} failed: {e}")))?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        },
    }
}

/// Hop-by-hop and transport headers the client controls.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
