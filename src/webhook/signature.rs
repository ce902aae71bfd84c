//! HMAC-SHA256 payload signing for outbound webhooks.
//!
//! Receivers verify the `X-Webhook-Signature` header against the raw
//! request body using the shared secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Sign a payload, producing `sha256=<hex digest>`.
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(digest))
}

/// Verify a signature against a payload. Comparison is constant-time.
pub fn verify(signature: &str, payload: &[u8], secret: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
