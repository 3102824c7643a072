//! Protocol constants for tapgate.
//!
//! This module centralizes the wire-contract constants shared with clients.
//! Most of these cannot change without breaking every paired device, so they
//! live here rather than in configuration.
//!
//! # Categories
//!
//! - **Authentication**: replay-protection and clock-skew bounds
//! - **Approvals**: request TTLs and pending-set limits
//! - **Rate limiting**: fixed-window counters
//! - **Web Push**: delivery and encryption framing parameters

/// Maximum allowed difference between the request timestamp and server time.
///
/// Bounds the replay window: a captured signed request is only valid for
/// this long even before the nonce cache is consulted. Also tolerates
/// moderate client clock skew.
pub const MAX_TIMESTAMP_DRIFT_SECONDS: i64 = 60;

/// How long a seen nonce is remembered before lazy eviction.
///
/// Must exceed `MAX_TIMESTAMP_DRIFT_SECONDS` so a nonce can never be
/// replayed inside the timestamp window after its cache entry is dropped.
pub const NONCE_TTL_SECONDS: u64 = 600;

/// Time-to-live for approval requests created via the current (header-auth)
/// protocol generation.
pub const REQUEST_TTL_SECONDS: u64 = 120;

/// Time-to-live for approval requests created via the legacy
/// (body-embedded-auth) protocol generation.
pub const LEGACY_REQUEST_TTL_SECONDS: u64 = 600;

/// Maximum number of simultaneously pending approval requests per pairing.
///
/// The legacy generation capped this at 3, which starved multi-agent
/// setups; the current ceiling is effectively "don't let one pairing eat
/// the process".
pub const MAX_PENDING_REQUESTS: usize = 2000;

/// Maximum approval-request creations per rate-limit window.
pub const MAX_REQUESTS_PER_WINDOW: u32 = 30;

/// Length of the fixed rate-limit window in seconds.
pub const RATE_LIMIT_WINDOW_SECONDS: u64 = 600;

/// Maximum accepted request body size in bytes.
pub const MAX_PAYLOAD_SIZE_BYTES: usize = 8192;

/// How long decided/expired approval records are retained after their
/// `expiresAt` before the lazy sweep prunes them.
///
/// Long enough for any reasonable poller to observe the terminal status;
/// the current-generation API reports pruned records as `expired`.
pub const TERMINAL_RETENTION_SECONDS: u64 = 86_400;

/// TTL header value for push-service message retention (24 hours).
pub const PUSH_TTL_SECONDS: u64 = 86_400;

/// VAPID JWT expiry offset from now (24 hours, the RFC 8292 maximum).
pub const VAPID_EXPIRY_SECONDS: u64 = 86_400;

/// Record size field in the aes128gcm content header.
///
/// All messages fit in a single record; 4096 matches what browser push
/// services emit and accept.
pub const PUSH_RECORD_SIZE: u32 = 4096;
