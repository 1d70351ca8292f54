//! HMAC-SHA256 payload signing.
//!
//! Every delivery carries `X-Webhook-Signature: base64(HMAC-SHA256(secret,
//! body))`, computed over the exact bytes placed on the wire.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use crate::{
    error::{CoreError, Result},
    models::{Webhook, WebhookSecret},
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Prefix of generated secrets.
pub const SECRET_PREFIX: &str = "whsec_";

const SECRET_BYTES: usize = 32;

/// Generates a fresh high-entropy signing secret.
pub fn generate_secret() -> WebhookSecret {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill(&mut bytes);
    WebhookSecret::new(format!("{SECRET_PREFIX}{}", hex::encode(bytes)))
}

/// Signs `payload` with `secret`, returning the base64 digest.
///
/// # Errors
///
/// Returns `CoreError::Validation` when the secret is empty; delivery aborts
/// before any network call in that case.
pub fn sign(secret: &WebhookSecret, payload: &[u8]) -> Result<String> {
    let mac = keyed_mac(secret, payload)?;
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Checks `candidate` against the signature of `payload` under `secret`.
///
/// The comparison is constant-time. Malformed base64 or an empty secret
/// verify as `false`.
pub fn verify(candidate: &str, payload: &[u8], secret: &WebhookSecret) -> bool {
    let Ok(candidate) = STANDARD.decode(candidate.trim()) else {
        return false;
    };
    keyed_mac(secret, payload).is_ok_and(|mac| mac.verify_slice(&candidate).is_ok())
}

/// Receiver-side check that honours a secret rotation grace window.
///
/// Accepts signatures made with the webhook's active secret, or with its
/// previous secret until `pending_old_secret_expiry` passes.
pub fn verify_with_rotation(
    candidate: &str,
    payload: &[u8],
    webhook: &Webhook,
    now: DateTime<Utc>,
) -> bool {
    webhook
        .verification_secrets(now)
        .into_iter()
        .any(|secret| verify(candidate, payload, secret))
}

fn keyed_mac(secret: &WebhookSecret, payload: &[u8]) -> Result<HmacSha256> {
    if secret.as_bytes().is_empty() {
        return Err(CoreError::validation("signing secret is unavailable"));
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CoreError::validation(format!("invalid signing secret: {e}")))?;
    mac.update(payload);
    Ok(mac)
}
