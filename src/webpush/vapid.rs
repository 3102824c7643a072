//! VAPID key management for Web Push (RFC 8292).
//!
//! The server identifies itself to push services with a P-256 ECDSA
//! keypair. The private key is stored as the raw 32-byte scalar
//! (base64url); the public key as the uncompressed SEC1 point (65 bytes,
//! base64url) - the exact form browsers accept as `applicationServerKey`.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// VAPID keypair for web push authentication.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VapidKeys {
    /// Raw 32-byte P-256 private key scalar (base64url).
    private_key_b64: String,
    /// Uncompressed public key bytes (base64url, 65 bytes decoded).
    public_key_b64: String,
}

impl VapidKeys {
    /// Generate a fresh VAPID keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        // SEC1 uncompressed public key (65 bytes: 0x04 || x || y)
        let public_bytes = verifying_key.to_encoded_point(false);

        Self {
            private_key_b64: BASE64URL.encode(signing_key.to_bytes().as_slice()),
            public_key_b64: BASE64URL.encode(public_bytes.as_bytes()),
        }
    }

    /// Base64url-encoded uncompressed public key (65 bytes decoded).
    ///
    /// Sent to clients as the VAPID `applicationServerKey` and placed in
    /// the `k=` parameter of the push Authorization header.
    pub fn public_key_base64url(&self) -> &str {
        &self.public_key_b64
    }

    /// Reconstruct from base64url-encoded strings.
    ///
    /// Validates both the public key format and the private key scalar.
    pub fn from_base64url(public_key_b64: &str, private_key_b64: &str) -> Result<Self> {
        let pub_bytes = BASE64URL
            .decode(public_key_b64)
            .context("Invalid base64url for VAPID public key")?;
        anyhow::ensure!(
            pub_bytes.len() == 65 && pub_bytes[0] == 0x04,
            "VAPID public key must be 65-byte uncompressed P-256 point"
        );

        let priv_bytes = BASE64URL
            .decode(private_key_b64)
            .context("Invalid base64url for VAPID private key")?;
        anyhow::ensure!(
            priv_bytes.len() == 32,
            "VAPID private key must be 32-byte P-256 scalar, got {} bytes",
            priv_bytes.len()
        );
        SigningKey::from_bytes(priv_bytes.as_slice().into())
            .context("VAPID private key is not a valid P-256 scalar")?;

        Ok(Self {
            private_key_b64: private_key_b64.to_string(),
            public_key_b64: public_key_b64.to_string(),
        })
    }

    /// The ES256 signing key for JWT generation.
    pub fn signing_key(&self) -> Result<SigningKey> {
        let priv_bytes = BASE64URL
            .decode(&self.private_key_b64)
            .context("Failed to decode VAPID private key")?;
        SigningKey::from_bytes(priv_bytes.as_slice().into())
            .context("VAPID private key is not a valid P-256 scalar")
    }

    /// Uncompressed public key bytes (65 bytes).
    pub fn public_key_bytes(&self) -> Result<Vec<u8>> {
        BASE64URL
            .decode(&self.public_key_b64)
            .context("Failed to decode VAPID public key")
    }

    /// Load the keypair from `path`, generating and persisting one if the
    /// file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read VAPID keys from {}", path.display()))?;
            let keys: Self = serde_json::from_slice(&bytes).context("Invalid VAPID key file")?;
            // Re-validate so a corrupt file fails here, not mid-delivery.
            return Self::from_base64url(&keys.public_key_b64, &keys.private_key_b64);
        }

        let keys = Self::generate();
        let json = serde_json::to_vec_pretty(&keys).context("Failed to serialize VAPID keys")?;
        crate::config::write_private_file(path, &json)?;
        log::info!("[WebPush] Generated new VAPID keypair at {}", path.display());
        Ok(keys)
    }
}
