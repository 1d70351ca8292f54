//! Input validation for webhook registration and updates.
//!
//! Everything here runs before the registry touches storage, so a rejected
//! request never leaves partial state behind.

use std::collections::{BTreeMap, BTreeSet};

use http::{HeaderName, HeaderValue};

use crate::{
    error::{CoreError, Result},
    models::EventType,
    signing::SIGNATURE_HEADER,
};

/// Longest accepted webhook URL.
pub const MAX_URL_LEN: usize = 2048;

/// Most custom headers a webhook may carry.
pub const MAX_CUSTOM_HEADERS: usize = 20;

/// Headers set by the delivery worker that subscribers may not override.
pub const RESERVED_HEADERS: [&str; 7] = [
    SIGNATURE_HEADER,
    "Content-Type",
    "Content-Length",
    "Host",
    "X-Webhook-Event-Id",
    "X-Webhook-Event-Type",
    "X-Webhook-Attempt",
];

/// Validates a destination URL.
///
/// The scheme must be `https`. `allow_insecure` additionally admits `http`
/// for local development and tests.
///
/// # Errors
///
/// Returns `CoreError::Validation` for unparseable URLs, other schemes,
/// missing hosts, or embedded credentials.
pub fn validate_url(raw: &str, allow_insecure: bool) -> Result<url::Url> {
    if raw.len() > MAX_URL_LEN {
        return Err(CoreError::validation(format!("url exceeds {MAX_URL_LEN} characters")));
    }

    let parsed =
        url::Url::parse(raw).map_err(|e| CoreError::validation(format!("invalid url: {e}")))?;

    match parsed.scheme() {
        "https" => {},
        "http" if allow_insecure => {},
        "http" => return Err(CoreError::validation("webhook urls must use https")),
        scheme => {
            return Err(CoreError::validation(format!("unsupported url scheme: {scheme}")));
        },
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(CoreError::validation("url must include a host"));
    }

    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(CoreError::validation("url must not embed credentials"));
    }

    Ok(parsed)
}

/// Parses event type names into a non-empty set.
///
/// # Errors
///
/// Returns `CoreError::Validation` when the list is empty or contains an
/// unrecognized type.
pub fn validate_events<S: AsRef<str>>(events: &[S]) -> Result<BTreeSet<EventType>> {
    if events.is_empty() {
        return Err(CoreError::validation("events must contain at least one event type"));
    }
    events.iter().map(|event| event.as_ref().parse::<EventType>()).collect()
}

/// Validates custom header names and values.
///
/// # Errors
///
/// Returns `CoreError::Validation` for invalid header syntax, reserved
/// names, or too many headers.
pub fn validate_custom_headers(headers: &BTreeMap<String, String>) -> Result<()> {
    if headers.len() > MAX_CUSTOM_HEADERS {
        return Err(CoreError::validation(format!(
            "at most {MAX_CUSTOM_HEADERS} custom headers are allowed"
        )));
    }

    for (name, value) in headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| CoreError::validation(format!("invalid header name: {name}")))?;
        HeaderValue::from_str(value)
            .map_err(|_| CoreError::validation(format!("invalid value for header {name}")))?;

        if RESERVED_HEADERS.iter().any(|reserved| reserved.eq_ignore_ascii_case(name)) {
            return Err(CoreError::validation(format!("header {name} is reserved")));
        }
    }

    Ok(())
}

/// Validates requested rate limits against the operator ceilings.
///
/// # Errors
///
/// Returns `CoreError::Validation` for zero limits, a per-minute limit above
/// the per-hour limit, or any limit above its ceiling.
pub fn validate_rate_limits(
    per_minute: u32,
    per_hour: u32,
    ceiling_per_minute: u32,
    ceiling_per_hour: u32,
) -> Result<()> {
    if per_minute == 0 || per_hour == 0 {
        return Err(CoreError::validation("rate limits must be positive"));
    }
    if per_minute > per_hour {
        return Err(CoreError::validation(
            "rate_limit_per_minute cannot exceed rate_limit_per_hour",
        ));
    }
    if per_minute > ceiling_per_minute {
        return Err(CoreError::validation(format!(
            "rate_limit_per_minute {per_minute} exceeds the ceiling of {ceiling_per_minute}"
        )));
    }
    if per_hour > ceiling_per_hour {
        return Err(CoreError::validation(format!(
            "rate_limit_per_hour {per_hour} exceeds the ceiling of {ceiling_per_hour}"
        )));
    }
    Ok(())
}
