//! Webhook authenticity: `sha256=<hex>` HMAC over the raw request body.

use crate::error::AppError;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Check `header` against HMAC-SHA256(secret, body).
///
/// Must be handed the exact bytes received; re-serialized JSON will not verify.
pub fn verify_signature(
    body: &[u8],
    header: Option<&str>,
    secret: Option<&str>,
) -> Result<(), AppError> {
    let header = header.map(str::trim).filter(|h| !h.is_empty());
    let secret = secret.filter(|s| !s.is_empty());
    let (Some(header), Some(secret)) = (header, secret) else {
        warn!("webhook signature or secret missing");
        return Err(AppError::MissingSignature);
    };

    let digest = header
        .strip_prefix("sha256=")
        .and_then(|hex_digest| hex::decode(hex_digest).ok())
        .ok_or(AppError::InvalidSignature)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AppError::InvalidSignature)?;
    mac.update(body);
    // constant-time comparison
    mac.verify_slice(&digest).map_err(|_| {
        warn!("webhook signature mismatch");
        AppError::InvalidSignature
    })
}

/// Compare a presented secret with the configured one in constant time.
pub fn secrets_match(given: &str, expected: &str) -> bool {
    let given = Sha256::digest(given.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    given
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// The header value a sender would produce for `body`.
#[cfg(test)]
pub fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
