//! Tapgate - approval relay for coding-agent tool calls.
//!
//! A coding agent's hook submits tool calls here; the paired phone gets an
//! encrypted web push, the human taps allow or deny, and the hook polls
//! the decision back. There is no login or session model: every request
//! is individually HMAC-signed with a per-pairing secret.
//!
//! # Architecture
//!
//! ```text
//! agent hook ──> Authenticator ──> Approval actor ── create/decide/get
//!                     │                  ▲
//!                     ▼                  │
//!               Registry actor    mobile client
//!             (secret, nonces,          ▲
//!              rate limit, push)        │ encrypted push (VAPID + aes128gcm)
//!                     └──────> WebPush engine
//! ```
//!
//! Every pairing's state is owned by exactly one actor task per store;
//! check-then-act sequences (nonce replay, rate limits, pending caps) are
//! safe because all operations on a key are linearized through its
//! command queue.
//!
//! # Modules
//!
//! - [`signature`] - canonical strings and HMAC sign/verify
//! - [`auth`] - request authentication over both protocol generations
//! - [`registry`] - per-pairing device actors
//! - [`approvals`] - per-pairing approval-request actors
//! - [`webpush`] - VAPID + aes128gcm push pipeline
//! - [`server`] - axum HTTP dispatch

// Library modules
pub mod approvals;
pub mod auth;
pub mod config;
pub mod constants;
pub mod error;
pub mod registry;
pub mod server;
pub mod signature;
pub mod webpush;

// Re-export commonly used types
pub use approvals::{ApprovalRequest, Approvals, Decision, RequestPayload, RequestStatus};
pub use config::ServerConfig;
pub use error::{ApiError, AuthError};
pub use registry::{DeviceRegistry, PairingRecord, PairingSecret, PushSubscription};
pub use webpush::{VapidKeys, WebPushClient};
