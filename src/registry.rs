//! Device registry actor - one task per pairing.
//!
//! Each pairing id owns exactly one registry actor. The actor holds the
//! pairing secret, the optional push subscription, the seen-nonce cache,
//! and the fixed-window rate-limit counter. All mutations for a pairing
//! are linearized through the actor's command queue, which is what makes
//! the check-then-act sequences (nonce replay, rate limiting) safe.
//!
//! # Architecture
//!
//! ```text
//! HTTP handler ──┐
//! Authenticator ─┼── RegistryHandle (mpsc) ──> actor task ── DeviceState
//! Push teardown ─┘                                  │
//!                                                   └── <state>/pairings/<id>.json
//! ```
//!
//! The pairing identity (id, secret, push subscription) is written through
//! to disk so pairings survive restarts. The nonce cache and rate-limit
//! counters are ephemeral; both expire faster than any realistic restart
//! matters.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot, Mutex};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{MAX_REQUESTS_PER_WINDOW, NONCE_TTL_SECONDS, RATE_LIMIT_WINDOW_SECONDS};
use crate::error::RegistryError;

/// A base64-encoded 32-byte pairing secret.
///
/// Newtyped so it can never hit a log line through `Debug`, and zeroed on
/// drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
#[serde(transparent)]
pub struct PairingSecret(String);

impl PairingSecret {
    /// Wrap a standard-base64 secret string.
    pub fn new(secret_b64: impl Into<String>) -> Self {
        Self(secret_b64.into())
    }

    /// The standard-base64 form (wire/rest encoding).
    pub fn as_b64(&self) -> &str {
        &self.0
    }

    /// Decode to raw key bytes for HMAC use.
    pub fn decode(&self) -> Result<Vec<u8>> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
        BASE64.decode(&self.0).context("Invalid pairing secret encoding")
    }
}

impl std::fmt::Debug for PairingSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PairingSecret(..)")
    }
}

/// A browser push subscription as delivered by the mobile client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushSubscription {
    /// Push service endpoint URL.
    pub endpoint: String,
    /// Subscription key material.
    pub keys: PushKeys,
}

/// Key material inside a push subscription.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushKeys {
    /// Subscriber's P-256 ECDH public key (base64url, 65 bytes decoded).
    pub p256dh: String,
    /// Shared auth secret (base64url, 16 bytes decoded).
    pub auth: String,
}

/// The durable identity of a pairing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRecord {
    /// 128-bit random hex identity, immutable.
    pub pairing_id: String,
    /// Shared HMAC secret.
    pub pairing_secret: PairingSecret,
    /// Push subscription, once the mobile client enabled push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_subscription: Option<PushSubscription>,
    /// Unix seconds at registration.
    pub created_at: u64,
}

/// Outcome of an atomic nonce check-and-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceCheck {
    /// Fresh nonce; now recorded.
    Accepted,
    /// Seen within the TTL; reject the request.
    Reused,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether another request may be created in this window.
    pub allowed: bool,
    /// Requests remaining in the current window.
    pub remaining: u32,
}

/// In-memory state owned by one registry actor.
///
/// All methods take `now` explicitly so the nonce-TTL and window-reset
/// rules are pure functions of their inputs.
#[derive(Debug, Default)]
struct DeviceState {
    record: Option<PairingRecord>,
    used_nonces: HashMap<String, u64>,
    request_count: u32,
    window_start: u64,
}

impl DeviceState {
    /// Initialize or overwrite the pairing record. Idempotent.
    fn register(&mut self, record: PairingRecord) {
        self.record = Some(record);
    }

    /// Replace the push subscription; requires a registered record.
    fn register_push(&mut self, subscription: PushSubscription) -> Result<(), RegistryError> {
        let record = self.record.as_mut().ok_or(RegistryError::NotRegistered)?;
        record.push_subscription = Some(subscription);
        Ok(())
    }

    /// Drop the push subscription (push service reported it gone).
    fn clear_push(&mut self) {
        if let Some(record) = self.record.as_mut() {
            record.push_subscription = None;
        }
    }

    /// Atomically check and record a nonce.
    ///
    /// Expired entries are evicted on this same call; a nonce present in
    /// the map is never accepted until evicted.
    fn check_nonce(&mut self, nonce: &str, now: u64) -> NonceCheck {
        self.used_nonces.retain(|_, seen_at| now.saturating_sub(*seen_at) <= NONCE_TTL_SECONDS);

        if self.used_nonces.contains_key(nonce) {
            return NonceCheck::Reused;
        }
        self.used_nonces.insert(nonce.to_string(), now);
        NonceCheck::Accepted
    }

    /// Check the fixed rate-limit window, lazily resetting it on expiry.
    fn check_rate_limit(&mut self, now: u64) -> RateLimitDecision {
        if now.saturating_sub(self.window_start) > RATE_LIMIT_WINDOW_SECONDS {
            self.window_start = now;
            self.request_count = 0;
        }
        RateLimitDecision {
            allowed: self.request_count < MAX_REQUESTS_PER_WINDOW,
            remaining: MAX_REQUESTS_PER_WINDOW.saturating_sub(self.request_count),
        }
    }

    /// Count one request against the current window.
    fn increment_request_count(&mut self) -> u32 {
        self.request_count += 1;
        self.request_count
    }
}

/// Commands accepted by a registry actor.
enum RegistryCommand {
    Register {
        record: PairingRecord,
        reply: oneshot::Sender<()>,
    },
    RegisterPush {
        subscription: PushSubscription,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    ClearPush {
        reply: oneshot::Sender<()>,
    },
    CheckNonce {
        nonce: String,
        now: u64,
        reply: oneshot::Sender<NonceCheck>,
    },
    CheckRateLimit {
        now: u64,
        reply: oneshot::Sender<RateLimitDecision>,
    },
    IncrementRequestCount {
        reply: oneshot::Sender<u32>,
    },
    Get {
        reply: oneshot::Sender<Option<PairingRecord>>,
    },
}

/// Handle to one pairing's registry actor.
///
/// Cheap to clone; all clones feed the same command queue.
#[derive(Clone, Debug)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("Registry actor stopped"))?;
        reply_rx.await.context("Registry actor dropped reply")
    }

    /// Initialize or overwrite the pairing record.
    pub async fn register(&self, record: PairingRecord) -> Result<()> {
        self.call(|reply| RegistryCommand::Register { record, reply }).await
    }

    /// Store a push subscription for a registered pairing.
    pub async fn register_push(
        &self,
        subscription: PushSubscription,
    ) -> Result<Result<(), RegistryError>> {
        self.call(|reply| RegistryCommand::RegisterPush { subscription, reply }).await
    }

    /// Remove the push subscription (e.g. after 410 Gone from the service).
    pub async fn clear_push(&self) -> Result<()> {
        self.call(|reply| RegistryCommand::ClearPush { reply }).await
    }

    /// Atomically check and record a nonce at time `now`.
    pub async fn check_nonce(&self, nonce: String, now: u64) -> Result<NonceCheck> {
        self.call(|reply| RegistryCommand::CheckNonce { nonce, now, reply }).await
    }

    /// Check the rate-limit window at time `now`.
    pub async fn check_rate_limit(&self, now: u64) -> Result<RateLimitDecision> {
        self.call(|reply| RegistryCommand::CheckRateLimit { now, reply }).await
    }

    /// Count one request against the current window.
    pub async fn increment_request_count(&self) -> Result<u32> {
        self.call(|reply| RegistryCommand::IncrementRequestCount { reply }).await
    }

    /// Fetch a snapshot of the pairing record, if registered.
    pub async fn get(&self) -> Result<Option<PairingRecord>> {
        self.call(|reply| RegistryCommand::Get { reply }).await
    }
}

/// Actor task: applies commands to its `DeviceState` and writes the
/// pairing identity through to disk on mutation.
async fn run_actor(
    mut state: DeviceState,
    persist_path: Option<PathBuf>,
    mut rx: mpsc::Receiver<RegistryCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            RegistryCommand::Register { record, reply } => {
                state.register(record);
                persist(&state, persist_path.as_deref());
                let _ = reply.send(());
            }
            RegistryCommand::RegisterPush { subscription, reply } => {
                let result = state.register_push(subscription);
                if result.is_ok() {
                    persist(&state, persist_path.as_deref());
                }
                let _ = reply.send(result);
            }
            RegistryCommand::ClearPush { reply } => {
                state.clear_push();
                persist(&state, persist_path.as_deref());
                let _ = reply.send(());
            }
            RegistryCommand::CheckNonce { nonce, now, reply } => {
                let _ = reply.send(state.check_nonce(&nonce, now));
            }
            RegistryCommand::CheckRateLimit { now, reply } => {
                let _ = reply.send(state.check_rate_limit(now));
            }
            RegistryCommand::IncrementRequestCount { reply } => {
                let _ = reply.send(state.increment_request_count());
            }
            RegistryCommand::Get { reply } => {
                let _ = reply.send(state.record.clone());
            }
        }
    }
}

/// Write the pairing identity through to its JSON file.
///
/// Failures are logged and otherwise ignored: the in-memory actor remains
/// authoritative for the life of the process.
fn persist(state: &DeviceState, path: Option<&Path>) {
    let (Some(path), Some(record)) = (path, state.record.as_ref()) else {
        return;
    };
    match serde_json::to_vec_pretty(record) {
        Ok(json) => {
            if let Err(e) = crate::config::write_private_file(path, &json) {
                log::warn!("[Registry] Failed to persist pairing {}: {e:#}", record.pairing_id);
            }
        }
        Err(e) => log::warn!("[Registry] Failed to serialize pairing record: {e}"),
    }
}

/// Spawn-on-demand map of registry actors, one per pairing id.
///
/// The map mutex only guards handle lookup; it is never held across an
/// actor call, so operations on different pairings proceed concurrently.
#[derive(Debug)]
pub struct DeviceRegistry {
    state_dir: Option<PathBuf>,
    handles: Mutex<HashMap<String, RegistryHandle>>,
}

impl DeviceRegistry {
    /// Registry with write-through persistence under `state_dir/pairings/`.
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir: Some(state_dir),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// In-memory registry (tests, ephemeral deployments).
    pub fn in_memory() -> Self {
        Self {
            state_dir: None,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Get (spawning if needed) the actor handle for a pairing id.
    ///
    /// A freshly spawned actor loads any persisted pairing record first,
    /// so lookups keep working across restarts.
    pub async fn handle(&self, pairing_id: &str) -> RegistryHandle {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(pairing_id) {
            return handle.clone();
        }

        let persist_path = self.record_path(pairing_id);
        let state = DeviceState {
            record: persist_path.as_deref().and_then(load_record),
            ..DeviceState::default()
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_actor(state, persist_path, rx));

        let handle = RegistryHandle { tx };
        handles.insert(pairing_id.to_string(), handle.clone());
        handle
    }

    fn record_path(&self, pairing_id: &str) -> Option<PathBuf> {
        // Pairing ids are generated hex, but never trust them as path
        // segments anyway.
        if !pairing_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        self.state_dir
            .as_ref()
            .map(|dir| dir.join("pairings").join(format!("{pairing_id}.json")))
    }
}

/// Load a persisted pairing record, if present and readable.
fn load_record(path: &Path) -> Option<PairingRecord> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            log::warn!("[Registry] Ignoring unreadable pairing file {}: {e}", path.display());
            None
        }
    }
}
