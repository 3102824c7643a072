//! Approval-request actor - one task per pairing.
//!
//! Owns the set of in-flight and recently-decided approval requests for a
//! pairing. The per-request state machine is strictly monotonic:
//!
//! ```text
//! pending ──> allowed
//!         ──> denied
//!         ──> expired
//! ```
//!
//! Terminal states never transition again; at most one decision is ever
//! recorded per request id. Expiry is lazy - a pure function of
//! `(status, expiresAt, now)` evaluated at the start of every actor
//! operation. There is no background sweep, which keeps expiry and
//! `decide` from racing each other.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::constants::{MAX_PENDING_REQUESTS, TERMINAL_RETENTION_SECONDS};
use crate::error::ApprovalError;

/// What the agent is asking permission for. Opaque to the actor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestPayload {
    /// Tool name (e.g. "Bash", "Write").
    pub tool: String,
    /// Shell command, for command-shaped tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Tool arguments, when the hook forwards them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Working directory the agent runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Free-form summary for tools without a single command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Lifecycle state of an approval request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Awaiting a human decision.
    Pending,
    /// Approved.
    Allowed,
    /// Rejected.
    Denied,
    /// TTL elapsed before a decision arrived.
    Expired,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A human decision, as sent by the mobile client.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Approve the tool call.
    Allow,
    /// Reject the tool call.
    Deny,
}

/// Breadth of a decision. Interpreted by the agent-side hook's local
/// caching; stored and echoed verbatim here.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApprovalScope {
    /// This call only.
    #[serde(rename = "once")]
    Once,
    /// Every call to this tool for the session.
    #[serde(rename = "session-tool")]
    SessionTool,
    /// Every call for the session.
    #[serde(rename = "session-all")]
    SessionAll,
}

/// One approval request and its lifecycle state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// 128-bit random hex id, chosen by the creating client.
    pub request_id: String,
    /// Owning pairing.
    pub pairing_id: String,
    /// What is being approved.
    pub payload: RequestPayload,
    /// Current lifecycle state.
    pub status: RequestStatus,
    /// Decision breadth, set only on allow/deny.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ApprovalScope>,
    /// Unix milliseconds at creation.
    pub created_at: u64,
    /// `created_at` + the generation's TTL.
    pub expires_at: u64,
}

/// In-memory request store owned by one approvals actor.
///
/// Methods take `now_ms` explicitly; the actor supplies wall-clock time
/// and tests supply synthetic time.
#[derive(Debug, Default)]
struct ApprovalStore {
    requests: HashMap<String, ApprovalRequest>,
}

impl ApprovalStore {
    /// Lazy sweep: flip overdue pending requests to expired, and prune
    /// terminal records past the retention bound. Runs at the start of
    /// every operation; this is the only expiry mechanism.
    fn sweep(&mut self, now_ms: u64) {
        for request in self.requests.values_mut() {
            if request.status == RequestStatus::Pending && now_ms > request.expires_at {
                request.status = RequestStatus::Expired;
            }
        }
        let retention_ms = TERMINAL_RETENTION_SECONDS * 1000;
        self.requests.retain(|_, request| {
            request.status == RequestStatus::Pending
                || now_ms.saturating_sub(request.expires_at) <= retention_ms
        });
    }

    fn pending_count(&self) -> usize {
        self.requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .count()
    }

    fn create(
        &mut self,
        request_id: String,
        pairing_id: String,
        payload: RequestPayload,
        ttl_seconds: u64,
        now_ms: u64,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.sweep(now_ms);

        if self.pending_count() >= MAX_PENDING_REQUESTS {
            return Err(ApprovalError::TooManyPending);
        }

        let request = ApprovalRequest {
            request_id: request_id.clone(),
            pairing_id,
            payload,
            status: RequestStatus::Pending,
            scope: None,
            created_at: now_ms,
            expires_at: now_ms + ttl_seconds * 1000,
        };
        self.requests.insert(request_id, request.clone());
        Ok(request)
    }

    fn get(&mut self, request_id: &str, now_ms: u64) -> Option<ApprovalRequest> {
        self.sweep(now_ms);
        self.requests.get(request_id).cloned()
    }

    fn decide(
        &mut self,
        request_id: &str,
        decision: Decision,
        scope: Option<ApprovalScope>,
        now_ms: u64,
    ) -> Result<RequestStatus, ApprovalError> {
        self.sweep(now_ms);

        let request = self.requests.get_mut(request_id).ok_or(ApprovalError::NotFound)?;
        if request.status != RequestStatus::Pending {
            return Err(ApprovalError::AlreadyDecided(request.status));
        }

        request.status = match decision {
            Decision::Allow => RequestStatus::Allowed,
            Decision::Deny => RequestStatus::Denied,
        };
        request.scope = scope;
        Ok(request.status)
    }

    fn list_pending(&mut self, now_ms: u64) -> Vec<ApprovalRequest> {
        self.sweep(now_ms);
        let mut pending: Vec<ApprovalRequest> = self
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        pending
    }
}

/// Commands accepted by an approvals actor.
enum ApprovalsCommand {
    Create {
        request_id: String,
        pairing_id: String,
        payload: RequestPayload,
        ttl_seconds: u64,
        now_ms: u64,
        reply: oneshot::Sender<Result<ApprovalRequest, ApprovalError>>,
    },
    Get {
        request_id: String,
        now_ms: u64,
        reply: oneshot::Sender<Option<ApprovalRequest>>,
    },
    Decide {
        request_id: String,
        decision: Decision,
        scope: Option<ApprovalScope>,
        now_ms: u64,
        reply: oneshot::Sender<Result<RequestStatus, ApprovalError>>,
    },
    ListPending {
        now_ms: u64,
        reply: oneshot::Sender<Vec<ApprovalRequest>>,
    },
}

/// Handle to one pairing's approvals actor.
#[derive(Clone, Debug)]
pub struct ApprovalsHandle {
    tx: mpsc::Sender<ApprovalsCommand>,
}

impl ApprovalsHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ApprovalsCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("Approvals actor stopped"))?;
        reply_rx.await.context("Approvals actor dropped reply")
    }

    /// Insert a new pending request with the generation's TTL.
    pub async fn create(
        &self,
        request_id: String,
        pairing_id: String,
        payload: RequestPayload,
        ttl_seconds: u64,
    ) -> Result<Result<ApprovalRequest, ApprovalError>> {
        let now_ms = crate::signature::unix_millis();
        self.call(|reply| ApprovalsCommand::Create {
            request_id,
            pairing_id,
            payload,
            ttl_seconds,
            now_ms,
            reply,
        })
        .await
    }

    /// Fetch a request by id, after the lazy expiry sweep.
    pub async fn get(&self, request_id: String) -> Result<Option<ApprovalRequest>> {
        let now_ms = crate::signature::unix_millis();
        self.call(|reply| ApprovalsCommand::Get { request_id, now_ms, reply }).await
    }

    /// Record the one-shot human decision.
    pub async fn decide(
        &self,
        request_id: String,
        decision: Decision,
        scope: Option<ApprovalScope>,
    ) -> Result<Result<RequestStatus, ApprovalError>> {
        let now_ms = crate::signature::unix_millis();
        self.call(|reply| ApprovalsCommand::Decide {
            request_id,
            decision,
            scope,
            now_ms,
            reply,
        })
        .await
    }

    /// Pending requests, newest first.
    pub async fn list_pending(&self) -> Result<Vec<ApprovalRequest>> {
        let now_ms = crate::signature::unix_millis();
        self.call(|reply| ApprovalsCommand::ListPending { now_ms, reply }).await
    }
}

async fn run_actor(mut store: ApprovalStore, mut rx: mpsc::Receiver<ApprovalsCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            ApprovalsCommand::Create {
                request_id,
                pairing_id,
                payload,
                ttl_seconds,
                now_ms,
                reply,
            } => {
                let _ = reply.send(store.create(request_id, pairing_id, payload, ttl_seconds, now_ms));
            }
            ApprovalsCommand::Get { request_id, now_ms, reply } => {
                let _ = reply.send(store.get(&request_id, now_ms));
            }
            ApprovalsCommand::Decide {
                request_id,
                decision,
                scope,
                now_ms,
                reply,
            } => {
                let _ = reply.send(store.decide(&request_id, decision, scope, now_ms));
            }
            ApprovalsCommand::ListPending { now_ms, reply } => {
                let _ = reply.send(store.list_pending(now_ms));
            }
        }
    }
}

/// Spawn-on-demand map of approvals actors, one per pairing id.
#[derive(Debug, Default)]
pub struct Approvals {
    handles: Mutex<HashMap<String, ApprovalsHandle>>,
}

impl Approvals {
    /// Empty approvals map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (spawning if needed) the actor handle for a pairing id.
    pub async fn handle(&self, pairing_id: &str) -> ApprovalsHandle {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(pairing_id) {
            return handle.clone();
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_actor(ApprovalStore::default(), rx));

        let handle = ApprovalsHandle { tx };
        handles.insert(pairing_id.to_string(), handle.clone());
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tool: &str, details: &str) -> RequestPayload {
        RequestPayload {
            tool: tool.to_string(),
            command: None,
            args: None,
            cwd: None,
            details: Some(details.to_string()),
        }
    }

    fn create(store: &mut ApprovalStore, id: &str, now_ms: u64) -> ApprovalRequest {
        store
            .create(id.to_string(), "p1".to_string(), payload("Bash", "ls -la"), 120, now_ms)
            .expect("create")
    }

    #[test]
    fn test_create_then_deny_then_allow_scenario() {
        // The canonical lifecycle: create -> deny succeeds once -> every
        // later decision fails -> reads keep reporting the terminal state.
        let mut store = ApprovalStore::default();
        let now = 1_700_000_000_000;

        let request = create(&mut store, "r1", now);
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.expires_at, request.created_at + 120_000);

        let status = store.decide("r1", Decision::Deny, None, now + 1).expect("decide");
        assert_eq!(status, RequestStatus::Denied);

        assert_eq!(
            store.decide("r1", Decision::Allow, None, now + 2),
            Err(ApprovalError::AlreadyDecided(RequestStatus::Denied))
        );
        assert_eq!(
            store.get("r1", now + 3).map(|r| r.status),
            Some(RequestStatus::Denied)
        );
    }

    #[test]
    fn test_at_most_one_decision() {
        let mut store = ApprovalStore::default();
        let now = 1_000;
        create(&mut store, "r1", now);

        let outcomes = [
            store.decide("r1", Decision::Allow, Some(ApprovalScope::Once), now),
            store.decide("r1", Decision::Allow, None, now),
            store.decide("r1", Decision::Deny, None, now),
        ];
        let successes = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(successes, 1);
    }

    #[test]
    fn test_scope_recorded_on_decision() {
        let mut store = ApprovalStore::default();
        let now = 1_000;
        create(&mut store, "r1", now);

        store
            .decide("r1", Decision::Allow, Some(ApprovalScope::SessionTool), now)
            .expect("decide");
        let request = store.get("r1", now).expect("present");
        assert_eq!(request.scope, Some(ApprovalScope::SessionTool));
    }

    #[test]
    fn test_expiry_is_lazy_and_monotonic() {
        let mut store = ApprovalStore::default();
        let now = 1_000_000;
        let request = create(&mut store, "r1", now);

        // Still pending right at the boundary.
        assert_eq!(
            store.get("r1", request.expires_at).map(|r| r.status),
            Some(RequestStatus::Pending)
        );

        // One past expiry: observed expired without any sweep having run.
        assert_eq!(
            store.get("r1", request.expires_at + 1).map(|r| r.status),
            Some(RequestStatus::Expired)
        );

        // And can never be decided afterward.
        assert_eq!(
            store.decide("r1", Decision::Allow, None, request.expires_at + 2),
            Err(ApprovalError::AlreadyDecided(RequestStatus::Expired))
        );
    }

    #[test]
    fn test_decide_missing_request() {
        let mut store = ApprovalStore::default();
        assert_eq!(
            store.decide("ghost", Decision::Allow, None, 1_000),
            Err(ApprovalError::NotFound)
        );
    }

    #[test]
    fn test_too_many_pending() {
        let mut store = ApprovalStore::default();
        let now = 1_000;
        for i in 0..MAX_PENDING_REQUESTS {
            create(&mut store, &format!("r{i}"), now);
        }
        assert_eq!(
            store.create("overflow".to_string(), "p1".to_string(), payload("Bash", "x"), 120, now),
            Err(ApprovalError::TooManyPending)
        );

        // Deciding one frees a slot.
        store.decide("r0", Decision::Deny, None, now).expect("decide");
        assert!(store
            .create("r-next".to_string(), "p1".to_string(), payload("Bash", "y"), 120, now)
            .is_ok());
    }

    #[test]
    fn test_expired_requests_free_pending_slots() {
        let mut store = ApprovalStore::default();
        let now = 1_000_000;
        for i in 0..MAX_PENDING_REQUESTS {
            create(&mut store, &format!("r{i}"), now);
        }

        // All expire; the sweep inside create() flips them and admits the
        // newcomer.
        let later = now + 121_000;
        let request = store
            .create("fresh".to_string(), "p1".to_string(), payload("Bash", "z"), 120, later)
            .expect("create after expiry");
        assert_eq!(request.status, RequestStatus::Pending);
    }

    #[test]
    fn test_list_pending_newest_first() {
        let mut store = ApprovalStore::default();
        create(&mut store, "old", 1_000);
        create(&mut store, "mid", 2_000);
        create(&mut store, "new", 3_000);
        store.decide("mid", Decision::Allow, None, 3_000).expect("decide");

        let pending = store.list_pending(3_500);
        let ids: Vec<&str> = pending.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn test_terminal_records_pruned_after_retention() {
        let mut store = ApprovalStore::default();
        let now = 1_000_000;
        let request = create(&mut store, "r1", now);
        store.decide("r1", Decision::Allow, None, now).expect("decide");

        let retention_ms = TERMINAL_RETENTION_SECONDS * 1000;
        // Still readable inside retention.
        assert!(store.get("r1", request.expires_at + retention_ms).is_some());
        // Pruned past it; callers treat the absence as expired.
        assert!(store.get("r1", request.expires_at + retention_ms + 1).is_none());
    }

    #[tokio::test]
    async fn test_actors_are_per_pairing() {
        let approvals = Approvals::new();
        let a = approvals.handle("pa").await;
        let b = approvals.handle("pb").await;

        a.create("r1".to_string(), "pa".to_string(), payload("Bash", "ls"), 120)
            .await
            .expect("channel")
            .expect("create");

        assert!(a.get("r1".to_string()).await.expect("channel").is_some());
        assert!(b.get("r1".to_string()).await.expect("channel").is_none());
    }
}
