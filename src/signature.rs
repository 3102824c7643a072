//! Request-signing primitives shared by both protocol generations.
//!
//! Every authenticated call is signed with HMAC-SHA256 over a canonical
//! string derived from the HTTP request. The canonical layout is a wire
//! contract: changing the field order or delimiter invalidates every
//! existing pairing.
//!
//! # Canonical String
//!
//! ```text
//! METHOD \n PATH \n base64(SHA-256(body)) \n TIMESTAMP \n NONCE
//! ```
//!
//! Newline-joined, no trailing newline. Requests without a body hash the
//! empty byte string rather than omitting the field.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::MAX_TIMESTAMP_DRIFT_SECONDS;

type HmacSha256 = Hmac<Sha256>;

/// Build the canonical string covered by a request signature.
///
/// The exact byte layout is load-bearing; see the module docs.
pub fn canonical_string(
    method: &str,
    path: &str,
    body_hash: &str,
    timestamp: i64,
    nonce: &str,
) -> String {
    format!("{method}\n{path}\n{body_hash}\n{timestamp}\n{nonce}")
}

/// Hash a request body for inclusion in the canonical string.
///
/// Bodyless requests pass `b""` here; the empty-string digest is part of
/// the wire contract, not an omitted field.
pub fn hash_body(body: &[u8]) -> String {
    BASE64.encode(Sha256::digest(body))
}

/// Sign a canonical string with the pairing secret.
///
/// Returns the standard-base64 HMAC-SHA256 tag clients put in the
/// `Authorization` header (current generation) or `signature` field
/// (legacy generation).
pub fn sign(secret: &[u8], canonical: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key size");
    mac.update(canonical.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verify a base64 signature against a canonical string.
///
/// Comparison is constant-time via the HMAC verifier; a malformed base64
/// signature simply fails verification.
pub fn verify(secret: &[u8], canonical: &str, signature_b64: &str) -> bool {
    let Ok(signature) = BASE64.decode(signature_b64) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key size");
    mac.update(canonical.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

/// Whether a client timestamp falls inside the accepted drift window.
pub fn timestamp_in_range(timestamp: i64, now: i64) -> bool {
    (now - timestamp).abs() <= MAX_TIMESTAMP_DRIFT_SECONDS
}

/// Current unix time in whole seconds.
pub fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a 128-bit random identifier as lowercase hex.
///
/// Used for pairing ids and approval-request ids.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Generate a 16-byte random nonce, standard-base64 encoded.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Generate a 32-byte pairing secret, standard-base64 encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}
