//! End-to-end HTTP tests for both protocol generations.
//!
//! Each test boots the full axum stack on an ephemeral port and talks to
//! it exactly the way the agent hook and the mobile client do.

use std::sync::Arc;

use tapgate::server::{build_router, AppState};
use tapgate::signature;
use tapgate::webpush::{VapidKeys, WebPushClient};
use tapgate::DeviceRegistry;

/// Boot a server on an ephemeral port; returns its base URL and state.
async fn spawn_server() -> (String, Arc<AppState>) {
    let push = WebPushClient::new(VapidKeys::generate(), "mailto:test@example.com".to_string());
    let state = Arc::new(AppState::new(DeviceRegistry::in_memory(), push));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let base_url = format!("http://{}", listener.local_addr().expect("local addr"));

    let router = build_router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server");
    });

    (base_url, state)
}

async fn pair(client: &reqwest::Client, base_url: &str) -> (String, String) {
    let response: serde_json::Value = client
        .post(format!("{base_url}/pair/init"))
        .send()
        .await
        .expect("pair init")
        .json()
        .await
        .expect("json");
    assert_eq!(response["success"], true);
    (
        response["data"]["pairingId"].as_str().expect("pairingId").to_string(),
        response["data"]["pairingSecret"].as_str().expect("pairingSecret").to_string(),
    )
}

fn decode_secret(secret_b64: &str) -> Vec<u8> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    BASE64.decode(secret_b64).expect("valid secret")
}

/// Sign a current-generation request; returns the four header values.
fn v2_headers(
    pairing_id: &str,
    secret_b64: &str,
    method: &str,
    path: &str,
    body: &[u8],
) -> [(&'static str, String); 4] {
    let timestamp = signature::unix_seconds();
    let nonce = signature::generate_nonce();
    let canonical = signature::canonical_string(
        method,
        path,
        &signature::hash_body(body),
        timestamp,
        &nonce,
    );
    let sig = signature::sign(&decode_secret(secret_b64), &canonical);
    [
        ("X-Pairing-ID", pairing_id.to_string()),
        ("X-Timestamp", timestamp.to_string()),
        ("X-Nonce", nonce),
        ("Authorization", format!("HMAC-SHA256 {sig}")),
    ]
}

/// Build a legacy signed body the way old clients do: serialize with an
/// empty signature, hash, sign, splice the signature back in.
fn legacy_signed_body(secret_b64: &str, method: &str, path: &str, fields: &str) -> String {
    let timestamp = signature::unix_seconds();
    let nonce = signature::generate_nonce();
    let unsigned = format!(r#"{{{fields},"ts":{timestamp},"nonce":"{nonce}","signature":""}}"#);
    let canonical = signature::canonical_string(
        method,
        path,
        &signature::hash_body(unsigned.as_bytes()),
        timestamp,
        &nonce,
    );
    let sig = signature::sign(&decode_secret(secret_b64), &canonical);
    unsigned.replace("\"signature\":\"\"", &format!("\"signature\":\"{sig}\""))
}

async fn create_v2_request(
    client: &reqwest::Client,
    base_url: &str,
    pairing_id: &str,
    secret: &str,
    request_id: &str,
) -> reqwest::Response {
    let body = format!(
        r#"{{"requestId":"{request_id}","payload":{{"tool":"Bash","details":"ls -la"}}}}"#
    );
    let mut request = client.post(format!("{base_url}/v2/request"));
    for (name, value) in v2_headers(pairing_id, secret, "POST", "/v2/request", body.as_bytes()) {
        request = request.header(name, value);
    }
    request.body(body).send().await.expect("send")
}

async fn poll_v2_decision(
    client: &reqwest::Client,
    base_url: &str,
    pairing_id: &str,
    secret: &str,
    request_id: &str,
) -> serde_json::Value {
    let path = format!("/v2/decision/{request_id}");
    let mut request = client.get(format!("{base_url}{path}"));
    for (name, value) in v2_headers(pairing_id, secret, "GET", &path, b"") {
        request = request.header(name, value);
    }
    request.send().await.expect("send").json().await.expect("json")
}

#[tokio::test]
async fn test_full_approval_lifecycle() {
    let (base_url, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let (pairing_id, secret) = pair(&client, &base_url).await;

    // Agent hook creates a request over the current generation.
    let response = create_v2_request(&client, &base_url, &pairing_id, &secret, "r1").await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["data"]["requestId"], "r1");

    // Hook polls: still pending.
    let decision = poll_v2_decision(&client, &base_url, &pairing_id, &secret, "r1").await;
    assert_eq!(decision["data"]["status"], "pending");

    // Mobile client denies over the legacy generation, with a scope.
    let decide_body = legacy_signed_body(
        &secret,
        "POST",
        "/decision/r1",
        &format!(r#""pairingId":"{pairing_id}","decision":"deny","scope":"once""#),
    );
    let response = client
        .post(format!("{base_url}/decision/r1"))
        .body(decide_body)
        .send()
        .await
        .expect("decide");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["data"]["status"], "denied");

    // Hook observes the decision and the scope.
    let decision = poll_v2_decision(&client, &base_url, &pairing_id, &secret, "r1").await;
    assert_eq!(decision["data"]["status"], "denied");
    assert_eq!(decision["data"]["scope"], "once");

    // A second decision always fails.
    let retry_body = legacy_signed_body(
        &secret,
        "POST",
        "/decision/r1",
        &format!(r#""pairingId":"{pairing_id}","decision":"allow""#),
    );
    let response = client
        .post(format!("{base_url}/decision/r1"))
        .body(retry_body)
        .send()
        .await
        .expect("decide again");
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Request already decided");
}

#[tokio::test]
async fn test_unknown_request_reads_as_expired_on_v2() {
    let (base_url, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let (pairing_id, secret) = pair(&client, &base_url).await;

    let decision = poll_v2_decision(&client, &base_url, &pairing_id, &secret, "never-created").await;
    assert_eq!(decision["success"], true);
    assert_eq!(decision["data"]["status"], "expired");
}

#[tokio::test]
async fn test_legacy_generation_round_trip() {
    let (base_url, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let (pairing_id, secret) = pair(&client, &base_url).await;

    // Legacy create with body-embedded credentials.
    let create_body = legacy_signed_body(
        &secret,
        "POST",
        "/request",
        &format!(
            r#""pairingId":"{pairing_id}","requestId":"lr1","payload":{{"tool":"Write","details":"Write to: src/main.rs"}}"#
        ),
    );
    let response = client
        .post(format!("{base_url}/request"))
        .body(create_body)
        .send()
        .await
        .expect("create");
    assert_eq!(response.status(), 200);

    // Mobile UI fetches the full record.
    let body: serde_json::Value = client
        .get(format!("{base_url}/request/lr1?pairingId={pairing_id}"))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["payload"]["tool"], "Write");
    // Legacy requests get the long TTL.
    let created_at = body["data"]["createdAt"].as_u64().expect("createdAt");
    let expires_at = body["data"]["expiresAt"].as_u64().expect("expiresAt");
    assert_eq!(expires_at - created_at, 600_000);

    // Pending list shows it.
    let body: serde_json::Value = client
        .get(format!("{base_url}/requests/pending?pairingId={pairing_id}"))
        .send()
        .await
        .expect("pending")
        .json()
        .await
        .expect("json");
    assert_eq!(body["data"][0]["requestId"], "lr1");

    // Legacy polling via signed query parameters.
    let timestamp = signature::unix_seconds();
    let nonce = signature::generate_nonce();
    let canonical = signature::canonical_string(
        "GET",
        "/decision/lr1",
        &signature::hash_body(b""),
        timestamp,
        &nonce,
    );
    let sig = signature::sign(&decode_secret(&secret), &canonical);
    let url = reqwest::Url::parse_with_params(
        &format!("{base_url}/decision/lr1"),
        [
            ("pairingId", pairing_id.as_str()),
            ("ts", &timestamp.to_string()),
            ("nonce", &nonce),
            ("signature", &sig),
        ],
    )
    .expect("url");
    let body: serde_json::Value = client
        .get(url)
        .send()
        .await
        .expect("poll")
        .json()
        .await
        .expect("json");
    assert_eq!(body["data"]["status"], "pending");

    // Unknown ids stay 404 on the legacy generation.
    let response = client
        .get(format!("{base_url}/request/ghost?pairingId={pairing_id}"))
        .send()
        .await
        .expect("get ghost");
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_missing_credentials_rejected() {
    let (base_url, _state) = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base_url}/v2/request"))
        .body(r#"{"requestId":"r1","payload":{"tool":"Bash"}}"#)
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["error"], "Missing auth credentials");
}

#[tokio::test]
async fn test_tampered_signature_rejected() {
    let (base_url, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let (pairing_id, secret) = pair(&client, &base_url).await;

    let body = r#"{"requestId":"r1","payload":{"tool":"Bash"}}"#;
    let mut request = client.post(format!("{base_url}/v2/request"));
    for (name, value) in v2_headers(&pairing_id, &secret, "POST", "/v2/request", body.as_bytes()) {
        if name == "Authorization" {
            request = request.header(name, "HMAC-SHA256 AAAAinvalid");
        } else {
            request = request.header(name, value);
        }
    }
    let response = request.body(body).send().await.expect("send");
    assert_eq!(response.status(), 401);
    let parsed: serde_json::Value = response.json().await.expect("json");
    assert_eq!(parsed["error"], "Invalid signature");
}

#[tokio::test]
async fn test_nonce_replay_rejected() {
    let (base_url, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let (pairing_id, secret) = pair(&client, &base_url).await;

    let path = "/v2/decision/r1";
    let headers = v2_headers(&pairing_id, &secret, "GET", path, b"");

    let mut first = client.get(format!("{base_url}{path}"));
    let mut second = client.get(format!("{base_url}{path}"));
    for (name, value) in &headers {
        first = first.header(*name, value.as_str());
        second = second.header(*name, value.as_str());
    }

    assert_eq!(first.send().await.expect("first").status(), 200);
    let response = second.send().await.expect("second");
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["error"], "Nonce already used");
}

#[tokio::test]
async fn test_stale_timestamp_rejected() {
    let (base_url, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let (pairing_id, secret) = pair(&client, &base_url).await;

    let path = "/v2/decision/r1";
    let timestamp = signature::unix_seconds() - 300;
    let nonce = signature::generate_nonce();
    let canonical =
        signature::canonical_string("GET", path, &signature::hash_body(b""), timestamp, &nonce);
    let sig = signature::sign(&decode_secret(&secret), &canonical);

    let response = client
        .get(format!("{base_url}{path}"))
        .header("X-Pairing-ID", pairing_id.as_str())
        .header("X-Timestamp", timestamp.to_string())
        .header("X-Nonce", nonce)
        .header("Authorization", format!("HMAC-SHA256 {sig}"))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["error"], "Timestamp out of range");
}

#[tokio::test]
async fn test_unknown_pairing_rejected() {
    let (base_url, _state) = spawn_server().await;
    let client = reqwest::Client::new();

    let fake_secret = signature::generate_secret();
    let response = create_v2_request(&client, &base_url, "feedfacecafebeef", &fake_secret, "r1").await;
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["error"], "Device not found");
}

#[tokio::test]
async fn test_oversized_payload_rejected() {
    let (base_url, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let (pairing_id, secret) = pair(&client, &base_url).await;

    let details = "x".repeat(9000);
    let body = format!(r#"{{"requestId":"r1","payload":{{"tool":"Bash","details":"{details}"}}}}"#);
    let mut request = client.post(format!("{base_url}/v2/request"));
    for (name, value) in v2_headers(&pairing_id, &secret, "POST", "/v2/request", body.as_bytes()) {
        request = request.header(name, value);
    }
    let response = request.body(body).send().await.expect("send");
    assert_eq!(response.status(), 413);
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let (base_url, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let (pairing_id, secret) = pair(&client, &base_url).await;

    for i in 0..30 {
        let response =
            create_v2_request(&client, &base_url, &pairing_id, &secret, &format!("r{i}")).await;
        assert_eq!(response.status(), 200, "request {i} should pass");
    }

    let response = create_v2_request(&client, &base_url, &pairing_id, &secret, "r30").await;
    assert_eq!(response.status(), 429);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["error"], "Rate limit exceeded");
}

#[tokio::test]
async fn test_health_and_vapid_key() {
    let (base_url, state) = spawn_server().await;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .get(format!("{base_url}/health"))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], "ok");

    let body: serde_json::Value = client
        .get(format!("{base_url}/vapid-public-key"))
        .send()
        .await
        .expect("vapid")
        .json()
        .await
        .expect("json");
    assert_eq!(body["publicKey"], state.push.public_key_base64url());
}
