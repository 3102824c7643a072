//! Typed error taxonomy for the protocol core.
//!
//! Every actor operation returns a typed result; nothing panics across an
//! actor boundary. The HTTP layer maps each variant onto a status code and
//! a structured `{"success":false,"error":...}` body. Push-delivery
//! failures are deliberately absent here: they are logged and swallowed,
//! never surfaced to the request creator.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::approvals::RequestStatus;

/// Authentication failures, in the order the authenticator checks them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// One or more of pairing id, timestamp, nonce, signature is absent.
    #[error("Missing auth credentials")]
    MissingCredentials,
    /// Timestamp outside the accepted drift window.
    #[error("Timestamp out of range")]
    TimestampOutOfRange,
    /// No pairing record exists for the presented id.
    #[error("Device not found")]
    DeviceNotFound,
    /// Nonce already seen within its TTL.
    #[error("Nonce already used")]
    NonceReused,
    /// HMAC verification failed.
    #[error("Invalid signature")]
    InvalidSignature,
}

/// Device-registry operation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Operation requires a registered pairing record.
    #[error("Device not registered")]
    NotRegistered,
}

/// Approval-store operation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    /// No record for the request id (possibly expired and pruned).
    #[error("Request not found")]
    NotFound,
    /// The request already reached a terminal state.
    #[error("Request already decided")]
    AlreadyDecided(RequestStatus),
    /// The pairing has too many undecided requests in flight.
    #[error("Too many pending requests")]
    TooManyPending,
}

/// Top-level error type returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request failed authentication.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Device-registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Approval-store operation failed.
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    /// Fixed-window rate limit exhausted.
    #[error("Rate limit exceeded")]
    RateLimited,
    /// Body exceeds `MAX_PAYLOAD_SIZE_BYTES`.
    #[error("Payload too large")]
    PayloadTooLarge,
    /// Malformed request (bad JSON, missing fields, bad query).
    #[error("{0}")]
    BadRequest(String),
    /// Unexpected internal failure (actor channel closed, storage error).
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// HTTP status for this error.
    fn status(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::MissingCredentials) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Registry(RegistryError::NotRegistered) => StatusCode::NOT_FOUND,
            Self::Approval(ApprovalError::NotFound) => StatusCode::NOT_FOUND,
            Self::Approval(ApprovalError::AlreadyDecided(_)) => StatusCode::BAD_REQUEST,
            Self::Approval(ApprovalError::TooManyPending) | Self::RateLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Internal details stay in the log; the client sees a generic message.
        if let Self::Internal(err) = &self {
            log::error!("[Api] Internal error: {err:#}");
        }
        let body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}
