//! Web push delivery: VAPID authentication and aes128gcm encryption.
//!
//! Wakes the paired mobile client with an encrypted push message. The
//! pipeline is built directly against the standards rather than a
//! push library, because the framing must be bit-exact:
//!
//! - RFC 8292 (VAPID): ES256 JWT proving message origin to the push
//!   service.
//! - RFC 8291 (aes128gcm): ECDH + two HKDF passes deriving an AES-128-GCM
//!   key/nonce, single `0x02` delimiter byte, binary content header.
//!
//! # Message framing
//!
//! ```text
//! salt(16) || record_size(4, BE) || keyid_len(1 = 65) ||
//! ephemeral_public_key(65, uncompressed) || ciphertext+tag
//! ```
//!
//! Delivery is best-effort: a failed push is logged and swallowed; the
//! approval workflow stays usable via polling.

// Rust guideline compliant 2026-02

pub mod vapid;

pub use vapid::VapidKeys;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use hkdf::Hkdf;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::elliptic_curve::rand_core::OsRng;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::approvals::RequestPayload;
use crate::constants::{PUSH_RECORD_SIZE, PUSH_TTL_SECONDS, VAPID_EXPIRY_SECONDS};
use crate::registry::PushSubscription;
use crate::signature::unix_seconds;

/// HKDF info prefix for the combined-key derivation (RFC 8291 §3.3).
const WEBPUSH_INFO_PREFIX: &[u8] = b"WebPush: info\0";
/// HKDF info for the content-encryption key (RFC 8188 §2.2).
const CEK_INFO: &[u8] = b"Content-Encoding: aes128gcm\0";
/// HKDF info for the AES-GCM nonce (RFC 8188 §2.3).
const NONCE_INFO: &[u8] = b"Content-Encoding: nonce\0";

/// The notification JSON shown by the mobile client's service worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotification {
    /// Notification title.
    pub title: String,
    /// Notification body line.
    pub body: String,
    /// Structured data for the service worker.
    pub data: NotificationData,
    /// Collapse key so repeated pushes for one request replace each other.
    pub tag: String,
    /// Keep the notification on screen until acted on.
    pub require_interaction: bool,
}

/// Payload data carried inside a push notification.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    /// The approval request the notification is about.
    pub request_id: String,
}

impl PushNotification {
    /// Build the notification for a newly created approval request.
    pub fn for_request(request_id: &str, payload: &RequestPayload) -> Self {
        let summary = payload
            .command
            .as_deref()
            .or(payload.details.as_deref())
            .unwrap_or("Action required");
        Self {
            title: "Agent needs approval".to_string(),
            body: format!("{}: {}", payload.tool, summary),
            data: NotificationData {
                request_id: request_id.to_string(),
            },
            tag: request_id.to_string(),
            require_interaction: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtHeader {
    typ: &'static str,
    alg: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
struct VapidClaims {
    aud: String,
    exp: u64,
    sub: String,
}

/// Build the `Authorization: vapid t=<jwt>, k=<key>` header value for a
/// push endpoint.
///
/// The JWT audience is the endpoint's origin, expiry is now + 24h (the
/// RFC 8292 maximum), and the subject is the operator contact URI.
pub fn vapid_authorization(keys: &VapidKeys, endpoint: &str, subject: &str) -> Result<String> {
    let url = reqwest::Url::parse(endpoint).context("Invalid push endpoint URL")?;
    let audience = url.origin().ascii_serialization();

    let header = JwtHeader {
        typ: "JWT",
        alg: "ES256",
    };
    let claims = VapidClaims {
        aud: audience,
        exp: unix_seconds() as u64 + VAPID_EXPIRY_SECONDS,
        sub: subject.to_string(),
    };

    let header_b64 = BASE64URL.encode(serde_json::to_vec(&header)?);
    let claims_b64 = BASE64URL.encode(serde_json::to_vec(&claims)?);
    let signing_input = format!("{header_b64}.{claims_b64}");

    let signing_key = keys.signing_key()?;
    let jwt = format!("{signing_input}.{}", sign_es256(&signing_key, &signing_input));

    Ok(format!("vapid t={jwt}, k={}", keys.public_key_base64url()))
}

/// ES256-sign a JWT signing input, returning the base64url raw r‖s form.
fn sign_es256(key: &SigningKey, signing_input: &str) -> String {
    let signature: Signature = key.sign(signing_input.as_bytes());
    BASE64URL.encode(signature.to_bytes())
}

/// Encrypt a push payload for a subscription (RFC 8291 aes128gcm).
///
/// Generates a fresh ephemeral keypair and salt per message, then defers
/// to [`encrypt_with`] for the deterministic part of the pipeline.
pub fn encrypt_payload(subscription: &PushSubscription, plaintext: &[u8]) -> Result<Vec<u8>> {
    let ua_public_bytes = BASE64URL
        .decode(&subscription.keys.p256dh)
        .context("Invalid base64url subscriber public key")?;
    let ua_public = PublicKey::from_sec1_bytes(&ua_public_bytes)
        .context("Subscriber key is not a valid P-256 point")?;
    let auth_secret = BASE64URL
        .decode(&subscription.keys.auth)
        .context("Invalid base64url auth secret")?;

    let ephemeral = SecretKey::random(&mut OsRng);
    let mut salt = [0u8; 16];
    rand::rng().fill_bytes(&mut salt);

    encrypt_with(&ephemeral, &salt, &ua_public, &auth_secret, plaintext)
}

/// Deterministic aes128gcm encryption with caller-supplied ephemeral key
/// and salt.
///
/// Key schedule (all HKDF-SHA256):
/// 1. `ecdh = ECDH(ephemeral, ua_public)`
/// 2. `ikm = HKDF(salt=auth_secret, ecdh, "WebPush: info\0" || ua_public
///    || ephemeral_public, 32)`
/// 3. `cek = HKDF(salt, ikm, CEK_INFO, 16)`; `nonce = HKDF(salt, ikm,
///    NONCE_INFO, 12)` - the framing salt is the derivation salt.
///
/// The plaintext gets a single `0x02` delimiter byte (last record, no
/// padding) before AES-128-GCM; the GCM tag rides at the end of the
/// ciphertext.
fn encrypt_with(
    ephemeral: &SecretKey,
    salt: &[u8; 16],
    ua_public: &PublicKey,
    auth_secret: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let shared = p256::ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), ua_public.as_affine());
    let ephemeral_public = ephemeral.public_key().to_encoded_point(false);
    let ua_public_point = ua_public.to_encoded_point(false);

    let (cek, nonce) = derive_content_keys(
        shared.raw_secret_bytes().as_slice(),
        auth_secret,
        ua_public_point.as_bytes(),
        ephemeral_public.as_bytes(),
        salt,
    )?;

    let mut padded = Vec::with_capacity(plaintext.len() + 1);
    padded.extend_from_slice(plaintext);
    padded.push(0x02);

    let cipher = Aes128Gcm::new_from_slice(&cek).expect("CEK is 16 bytes");
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), padded.as_slice())
        .map_err(|e| anyhow::anyhow!("Payload encryption failed: {e}"))?;

    let mut framed = Vec::with_capacity(16 + 4 + 1 + 65 + ciphertext.len());
    framed.extend_from_slice(salt);
    framed.extend_from_slice(&PUSH_RECORD_SIZE.to_be_bytes());
    framed.push(65);
    framed.extend_from_slice(ephemeral_public.as_bytes());
    framed.extend_from_slice(&ciphertext);
    Ok(framed)
}

/// Two-pass HKDF schedule shared by the encrypt path and the test-side
/// reference decryptor.
fn derive_content_keys(
    ecdh_secret: &[u8],
    auth_secret: &[u8],
    ua_public: &[u8],
    as_public: &[u8],
    salt: &[u8],
) -> Result<([u8; 16], [u8; 12])> {
    let mut key_info = Vec::with_capacity(WEBPUSH_INFO_PREFIX.len() + 130);
    key_info.extend_from_slice(WEBPUSH_INFO_PREFIX);
    key_info.extend_from_slice(ua_public);
    key_info.extend_from_slice(as_public);

    let hk = Hkdf::<Sha256>::new(Some(auth_secret), ecdh_secret);
    let mut ikm = [0u8; 32];
    hk.expand(&key_info, &mut ikm)
        .map_err(|_| anyhow::anyhow!("HKDF expand failed for IKM"))?;

    let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
    let mut cek = [0u8; 16];
    hk.expand(CEK_INFO, &mut cek)
        .map_err(|_| anyhow::anyhow!("HKDF expand failed for CEK"))?;
    let mut nonce = [0u8; 12];
    hk.expand(NONCE_INFO, &mut nonce)
        .map_err(|_| anyhow::anyhow!("HKDF expand failed for nonce"))?;

    Ok((cek, nonce))
}

/// What a delivery attempt says about the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted by the push service.
    Delivered,
    /// Push service throttled us; subscription still valid.
    RateLimited,
    /// Subscription is gone (404/410); the caller should drop it.
    Stale,
}

/// Sends encrypted web push messages with VAPID authentication.
///
/// The reqwest client is reused across sends for connection pooling.
#[derive(Clone, Debug)]
pub struct WebPushClient {
    http: reqwest::Client,
    keys: VapidKeys,
    subject: String,
}

impl WebPushClient {
    /// Client pushing as the given VAPID identity.
    pub fn new(keys: VapidKeys, subject: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            keys,
            subject,
        }
    }

    /// The public key clients subscribe with.
    pub fn public_key_base64url(&self) -> &str {
        self.keys.public_key_base64url()
    }

    /// Encrypt and deliver one notification.
    ///
    /// Errors cover encryption failures, transport failures, and non-2xx
    /// statuses other than the stale/throttled cases; callers treat all of
    /// them as best-effort.
    pub async fn send(
        &self,
        subscription: &PushSubscription,
        notification: &PushNotification,
    ) -> Result<PushOutcome> {
        let payload = serde_json::to_vec(notification).context("Failed to serialize notification")?;
        let body = encrypt_payload(subscription, &payload)?;
        let authorization = vapid_authorization(&self.keys, &subscription.endpoint, &self.subject)?;

        let response = self
            .http
            .post(&subscription.endpoint)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Encoding", "aes128gcm")
            .header("TTL", PUSH_TTL_SECONDS.to_string())
            .header("Authorization", authorization)
            .body(body)
            .send()
            .await
            .context("Web push HTTP request failed")?;

        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(PushOutcome::Delivered),
            404 | 410 => {
                log::info!("[WebPush] Subscription expired (HTTP {status})");
                Ok(PushOutcome::Stale)
            }
            429 => {
                log::warn!("[WebPush] Rate limited by push service");
                Ok(PushOutcome::RateLimited)
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(anyhow::anyhow!("Web push send failed (HTTP {status}): {body}"))
            }
        }
    }
}
