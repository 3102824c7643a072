//! Request handlers and credential adapters for both protocol generations.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::AppState;
use crate::approvals::{ApprovalRequest, ApprovalScope, Decision, RequestPayload, RequestStatus};
use crate::auth::{self, Credentials};
use crate::constants::{LEGACY_REQUEST_TTL_SECONDS, MAX_PAYLOAD_SIZE_BYTES, REQUEST_TTL_SECONDS};
use crate::error::{ApiError, AuthError};
use crate::registry::{PairingRecord, PairingSecret, PushSubscription};
use crate::signature;
use crate::webpush::{PushNotification, PushOutcome};

/// Scheme prefix on the current generation's Authorization header.
const AUTH_SCHEME: &str = "HMAC-SHA256 ";

type ApiResult = Result<Json<Value>, ApiError>;

fn success(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

fn enforce_size(body: &Bytes) -> Result<(), ApiError> {
    if body.len() > MAX_PAYLOAD_SIZE_BYTES {
        return Err(ApiError::PayloadTooLarge);
    }
    Ok(())
}

fn bad_json(err: serde_json::Error) -> ApiError {
    ApiError::BadRequest(format!("Invalid request body: {err}"))
}

/// Extract current-generation credentials from request headers.
fn header_credentials(headers: &HeaderMap) -> Result<Credentials, AuthError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let pairing_id = header("x-pairing-id");
    let timestamp = header("x-timestamp").and_then(|t| t.parse::<i64>().ok());
    let nonce = header("x-nonce");
    let signature = header("authorization").and_then(|v| v.strip_prefix(AUTH_SCHEME));

    match (pairing_id, timestamp, nonce, signature) {
        (Some(pairing_id), Some(timestamp), Some(nonce), Some(signature)) => Ok(Credentials {
            pairing_id: pairing_id.to_string(),
            timestamp,
            nonce: nonce.to_string(),
            signature: signature.to_string(),
        }),
        _ => Err(AuthError::MissingCredentials),
    }
}

/// Credentials as legacy clients embed them in JSON bodies.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BodyCredentials {
    pairing_id: Option<String>,
    ts: Option<i64>,
    nonce: Option<String>,
    signature: Option<String>,
}

impl BodyCredentials {
    fn into_credentials(self) -> Result<Credentials, AuthError> {
        match (self.pairing_id, self.ts, self.nonce, self.signature) {
            (Some(pairing_id), Some(timestamp), Some(nonce), Some(signature)) => Ok(Credentials {
                pairing_id,
                timestamp,
                nonce,
                signature,
            }),
            _ => Err(AuthError::MissingCredentials),
        }
    }
}

/// Extract legacy credentials from a query string (GET endpoints).
fn query_credentials(params: &HashMap<String, String>) -> Result<Credentials, AuthError> {
    let pairing_id = params.get("pairingId");
    let timestamp = params.get("ts").and_then(|t| t.parse::<i64>().ok());
    let nonce = params.get("nonce");
    let signature = params.get("signature");

    match (pairing_id, timestamp, nonce, signature) {
        (Some(pairing_id), Some(timestamp), Some(nonce), Some(signature)) => Ok(Credentials {
            pairing_id: pairing_id.clone(),
            timestamp,
            nonce: nonce.clone(),
            signature: signature.clone(),
        }),
        _ => Err(AuthError::MissingCredentials),
    }
}

/// Authenticate a legacy signed body: parse out the embedded credentials,
/// reconstruct the blanked body the client hashed, then run the shared
/// authenticator.
async fn authenticate_legacy_body(
    state: &AppState,
    method: &str,
    path: &str,
    body: &Bytes,
) -> Result<String, ApiError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| ApiError::BadRequest("Body is not UTF-8".to_string()))?;
    let creds: BodyCredentials = serde_json::from_slice(body).map_err(bad_json)?;
    let credentials = creds.into_credentials()?;

    let signed_body = auth::blank_signature_field(text);
    let pairing_id = auth::authenticate(
        &state.registry,
        method,
        path,
        signed_body.as_bytes(),
        &credentials,
    )
    .await?;
    Ok(pairing_id)
}

/// Shared creation pipeline: rate limit, insert, count, then fire push.
///
/// Push delivery is detached - the response returns before the push
/// service is contacted, and delivery failures never fail the creation.
async fn create_approval(
    state: &Arc<AppState>,
    pairing_id: String,
    request_id: String,
    payload: RequestPayload,
    ttl_seconds: u64,
) -> Result<ApprovalRequest, ApiError> {
    let device = state.registry.handle(&pairing_id).await;
    let now = signature::unix_seconds() as u64;
    if !device.check_rate_limit(now).await?.allowed {
        return Err(ApiError::RateLimited);
    }

    let approvals = state.approvals.handle(&pairing_id).await;
    let request = approvals
        .create(request_id, pairing_id, payload, ttl_seconds)
        .await??;

    device.increment_request_count().await?;

    if let Some(subscription) = device.get().await?.and_then(|r| r.push_subscription) {
        spawn_push(state, subscription, &request);
    }

    Ok(request)
}

/// Fire-and-forget push delivery for a freshly created request.
fn spawn_push(state: &Arc<AppState>, subscription: PushSubscription, request: &ApprovalRequest) {
    let push = state.push.clone();
    let state = Arc::clone(state);
    let pairing_id = request.pairing_id.clone();
    let notification = PushNotification::for_request(&request.request_id, &request.payload);

    tokio::spawn(async move {
        match push.send(&subscription, &notification).await {
            Ok(PushOutcome::Stale) => {
                log::info!("[WebPush] Dropping stale subscription for pairing");
                let device = state.registry.handle(&pairing_id).await;
                if let Err(e) = device.clear_push().await {
                    log::warn!("[WebPush] Failed to clear stale subscription: {e:#}");
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("[WebPush] Delivery failed: {e:#}"),
        }
    });
}

// === Current generation ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequestBody {
    request_id: String,
    payload: RequestPayload,
}

/// `POST /v2/request` - create an approval request (header auth).
pub async fn create_request_v2(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    enforce_size(&body)?;
    let credentials = header_credentials(&headers)?;
    let pairing_id =
        auth::authenticate(&state.registry, "POST", "/v2/request", &body, &credentials).await?;

    let parsed: CreateRequestBody = serde_json::from_slice(&body).map_err(bad_json)?;
    let request = create_approval(
        &state,
        pairing_id,
        parsed.request_id,
        parsed.payload,
        REQUEST_TTL_SECONDS,
    )
    .await?;

    Ok(success(json!({ "requestId": request.request_id })))
}

/// `GET /v2/decision/{id}` - poll for a decision (header auth).
///
/// A missing record reads as `expired`: "never existed" and "expired and
/// pruned" are indistinguishable to the poller by design.
pub async fn poll_decision_v2(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    let credentials = header_credentials(&headers)?;
    let path = format!("/v2/decision/{request_id}");
    let pairing_id =
        auth::authenticate(&state.registry, "GET", &path, b"", &credentials).await?;

    let approvals = state.approvals.handle(&pairing_id).await;
    let data = match approvals.get(request_id).await? {
        Some(request) => {
            let mut data = json!({ "status": request.status });
            if let Some(scope) = request.scope {
                data["scope"] = serde_json::to_value(scope).map_err(anyhow::Error::from)?;
            }
            data
        }
        None => json!({ "status": RequestStatus::Expired }),
    };
    Ok(success(data))
}

// === Legacy generation ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyCreateBody {
    request_id: String,
    payload: RequestPayload,
}

/// `POST /request` - create an approval request (body-embedded auth).
pub async fn create_request_legacy(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult {
    enforce_size(&body)?;
    let pairing_id = authenticate_legacy_body(&state, "POST", "/request", &body).await?;

    let parsed: LegacyCreateBody = serde_json::from_slice(&body).map_err(bad_json)?;
    let request = create_approval(
        &state,
        pairing_id,
        parsed.request_id,
        parsed.payload,
        LEGACY_REQUEST_TTL_SECONDS,
    )
    .await?;

    Ok(success(json!({ "requestId": request.request_id })))
}

/// `GET /request/{id}?pairingId=` - full request record for the mobile UI.
pub async fn get_request_legacy(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let pairing_id = params
        .get("pairingId")
        .ok_or_else(|| ApiError::BadRequest("pairingId required".to_string()))?;

    let approvals = state.approvals.handle(pairing_id).await;
    let request = approvals
        .get(request_id)
        .await?
        .ok_or(crate::error::ApprovalError::NotFound)?;
    Ok(success(serde_json::to_value(request).map_err(anyhow::Error::from)?))
}

#[derive(Debug, Deserialize)]
struct LegacyDecisionBody {
    decision: Decision,
    #[serde(default)]
    scope: Option<ApprovalScope>,
}

/// `POST /decision/{id}` - the mobile client's one-shot decision.
pub async fn submit_decision_legacy(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
    body: Bytes,
) -> ApiResult {
    enforce_size(&body)?;
    let path = format!("/decision/{request_id}");
    let pairing_id = authenticate_legacy_body(&state, "POST", &path, &body).await?;

    let parsed: LegacyDecisionBody = serde_json::from_slice(&body).map_err(bad_json)?;
    let approvals = state.approvals.handle(&pairing_id).await;
    let status = approvals
        .decide(request_id, parsed.decision, parsed.scope)
        .await??;

    Ok(success(json!({ "status": status })))
}

/// `GET /decision/{id}?pairingId&ts&nonce&signature` - legacy polling.
///
/// Unlike the current generation, an unknown record is a 404 here; old
/// hooks poll through 404s until their own deadline.
pub async fn poll_decision_legacy(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let credentials = query_credentials(&params)?;
    let path = format!("/decision/{request_id}");
    let pairing_id =
        auth::authenticate(&state.registry, "GET", &path, b"", &credentials).await?;

    let approvals = state.approvals.handle(&pairing_id).await;
    let request = approvals
        .get(request_id)
        .await?
        .ok_or(crate::error::ApprovalError::NotFound)?;
    Ok(success(json!({ "status": request.status })))
}

/// `GET /requests/pending?pairingId=` - pending requests, newest first.
pub async fn list_pending_legacy(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let pairing_id = params
        .get("pairingId")
        .ok_or_else(|| ApiError::BadRequest("pairingId required".to_string()))?;

    let approvals = state.approvals.handle(pairing_id).await;
    let pending = approvals.list_pending().await?;
    Ok(success(serde_json::to_value(pending).map_err(anyhow::Error::from)?))
}

// === Pairing and discovery ===

/// `POST /pair/init` - mint a new pairing.
///
/// The secret is returned exactly once; afterwards it exists only inside
/// the registry actor and the client's local storage.
pub async fn pair_init(State(state): State<Arc<AppState>>) -> ApiResult {
    let pairing_id = signature::generate_id();
    let pairing_secret = signature::generate_secret();

    let device = state.registry.handle(&pairing_id).await;
    device
        .register(PairingRecord {
            pairing_id: pairing_id.clone(),
            pairing_secret: PairingSecret::new(pairing_secret.clone()),
            push_subscription: None,
            created_at: signature::unix_seconds() as u64,
        })
        .await?;

    log::info!("[Pairing] Initialized pairing {pairing_id}");
    Ok(success(json!({
        "pairingId": pairing_id,
        "pairingSecret": pairing_secret,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterPushBody {
    push_subscription: PushSubscription,
}

/// `POST /pair/register-push` - store the mobile client's push
/// subscription (body-embedded auth).
pub async fn register_push(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    enforce_size(&body)?;
    let pairing_id =
        authenticate_legacy_body(&state, "POST", "/pair/register-push", &body).await?;

    let parsed: RegisterPushBody = serde_json::from_slice(&body).map_err(bad_json)?;
    let device = state.registry.handle(&pairing_id).await;
    device.register_push(parsed.push_subscription).await??;

    log::info!("[Pairing] Push subscription registered for {pairing_id}");
    Ok(Json(json!({ "success": true })))
}

/// `GET /vapid-public-key` - the key clients subscribe with.
pub async fn vapid_public_key(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "publicKey": state.push.public_key_base64url() }))
}

/// `GET /health` - liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
