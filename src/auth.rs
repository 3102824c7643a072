//! Request authentication.
//!
//! Orchestrates the signature codec and the device registry actor to
//! accept or reject inbound calls. Two protocol generations present the
//! same four credentials differently:
//!
//! - **Current**: `X-Pairing-ID`, `X-Timestamp`, `X-Nonce` headers plus
//!   `Authorization: HMAC-SHA256 <base64 sig>`.
//! - **Legacy**: `{pairingId, ts, nonce, signature}` embedded in the JSON
//!   body (or query string for GETs), with the body hash computed over the
//!   body as it looked before the client filled in the signature.
//!
//! Both feed the same canonical-string builder and the same actor API; the
//! adapters only extract credentials and (for legacy) reconstruct the
//! signed body bytes.

use crate::error::AuthError;
use crate::registry::{DeviceRegistry, NonceCheck};
use crate::signature;

/// The four credentials every authenticated request carries.
#[derive(Clone, Debug)]
pub struct Credentials {
    /// Pairing identity being claimed.
    pub pairing_id: String,
    /// Client unix timestamp in seconds.
    pub timestamp: i64,
    /// Single-use random value (standard base64).
    pub nonce: String,
    /// HMAC-SHA256 over the canonical string (standard base64).
    pub signature: String,
}

/// Authenticate a request and return the verified pairing id.
///
/// Checks run in a fixed order and short-circuit on first failure:
/// timestamp drift, device lookup, atomic nonce check-and-record, then
/// constant-time signature verification. On success the caller may act on
/// - and only on - this pairing's state: the actor lookup key *is* the
/// authenticated identity.
///
/// Note the nonce is consumed before the signature is checked, matching
/// the original protocol: a request with a bad signature still burns its
/// nonce.
pub async fn authenticate(
    registry: &DeviceRegistry,
    method: &str,
    path: &str,
    body: &[u8],
    credentials: &Credentials,
) -> Result<String, AuthError> {
    let now = signature::unix_seconds();
    if !signature::timestamp_in_range(credentials.timestamp, now) {
        return Err(AuthError::TimestampOutOfRange);
    }

    let device = registry.handle(&credentials.pairing_id).await;
    let record = device
        .get()
        .await
        .map_err(|_| AuthError::DeviceNotFound)?
        .ok_or(AuthError::DeviceNotFound)?;

    match device
        .check_nonce(credentials.nonce.clone(), now as u64)
        .await
        .map_err(|_| AuthError::DeviceNotFound)?
    {
        NonceCheck::Accepted => {}
        NonceCheck::Reused => return Err(AuthError::NonceReused),
    }

    let secret = record
        .pairing_secret
        .decode()
        .map_err(|_| AuthError::InvalidSignature)?;
    let canonical = signature::canonical_string(
        method,
        path,
        &signature::hash_body(body),
        credentials.timestamp,
        &credentials.nonce,
    );
    if !signature::verify(&secret, &canonical, &credentials.signature) {
        return Err(AuthError::InvalidSignature);
    }

    Ok(credentials.pairing_id.clone())
}

/// Reconstruct the body bytes a legacy client signed.
///
/// Legacy clients serialize the body with `"signature":""`, hash it, sign,
/// then splice the real signature in before sending. Clients serialize
/// compactly (no whitespace), so the signed form is recovered by blanking
/// the value of the `"signature"` key in the raw bytes. Returns the body
/// unchanged if no signature field is found.
pub fn blank_signature_field(body: &str) -> String {
    const KEY: &str = "\"signature\":\"";
    let Some(key_start) = body.find(KEY) else {
        return body.to_string();
    };
    let value_start = key_start + KEY.len();
    // Signatures are base64: no escapes, so the next quote ends the value.
    let Some(value_len) = body[value_start..].find('"') else {
        return body.to_string();
    };
    let mut blanked = String::with_capacity(body.len());
    blanked.push_str(&body[..value_start]);
    blanked.push_str(&body[value_start + value_len..]);
    blanked
}
