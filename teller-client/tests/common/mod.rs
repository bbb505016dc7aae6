#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use teller_client::{
    Client, Config, ConfirmationProvider, Credential, ExchangeError, HttpRequest, HttpResponse,
    HttpTransport, InMemoryStorage, RateLimits, Session, SessionStorage,
};

pub const PHONE:    &str = "+79990000000";
pub const PASSWORD: &str = "secret";
pub const BASE:     &str = "https://bank.test/api";

/// Session id the scripted login hands out.
pub const FRESH: &str = "fresh-session";

// ─── MockTransport ────────────────────────────────────────────────────────────

type Handler = Box<dyn Fn(&HttpRequest, usize) -> Result<HttpResponse, ExchangeError> + Send + Sync>;

/// Answers every request through `handler(request, n)`, where `n` counts the
/// earlier requests to the same path. Records everything it receives.
pub struct MockTransport {
    handler:  Handler,
    requests: parking_lot::Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new(
        handler: impl Fn(&HttpRequest, usize) -> Result<HttpResponse, ExchangeError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self { handler: Box::new(handler), requests: parking_lot::Mutex::new(Vec::new()) })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.path == path).count()
    }

    pub fn to(&self, path: &str) -> Vec<HttpRequest> {
        self.requests.lock().iter().filter(|r| r.path == path).cloned().collect()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ExchangeError> {
        let n = self.count(&request.path);
        self.requests.lock().push(request.clone());
        (self.handler)(&request, n)
    }
}

// ─── Responses ────────────────────────────────────────────────────────────────

pub fn envelope(code: &str, payload: Value) -> HttpResponse {
    HttpResponse::new(200, json!({
        "resultCode": code,
        "errorMessage": if code == "OK" { "" } else { "provider says no" },
        "payload": payload,
        "operationTicket": "",
    }).to_string())
}

pub fn ok(payload: Value) -> HttpResponse {
    envelope("OK", payload)
}

/// The provider's side of the programmatic login plus a healthy ping.
/// `None` for any other path.
pub fn login(request: &HttpRequest) -> Option<HttpResponse> {
    let response = match request.path.as_str() {
        "/common/v1/session" => ok(json!(FRESH)),
        "/common/v1/sign_up" if request.form_pairs().iter().any(|(k, _)| k == "phone") => {
            HttpResponse::new(200, json!({
                "resultCode": "WAITING_CONFIRMATION",
                "operationTicket": "T-1",
            }).to_string())
        }
        "/common/v1/sign_up" | "/common/v1/confirm" | "/common/v1/level_up" => ok(Value::Null),
        "/common/v1/ping" => ok(json!({ "accessLevel": "CLIENT" })),
        _ => return None,
    };
    Some(response)
}

// ─── Collaborators ────────────────────────────────────────────────────────────

/// Always answers with the same code and counts how often it was asked.
#[derive(Default)]
pub struct FixedCode {
    pub calls: AtomicUsize,
}

impl FixedCode {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfirmationProvider for FixedCode {
    async fn confirmation_code(&self, phone: &str) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        assert_eq!(phone, PHONE);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("1234".to_string())
    }
}

pub async fn storage_with(session: Option<&str>) -> Arc<InMemoryStorage> {
    let storage = Arc::new(InMemoryStorage::new());
    if let Some(id) = session {
        storage.upsert(PHONE, Some(&Session::new(id))).await.unwrap();
    }
    storage
}

pub fn config(transport: Arc<MockTransport>, codes: Arc<FixedCode>, storage: Arc<InMemoryStorage>) -> Config {
    Config::new(Credential::new(PHONE, PASSWORD), codes, storage)
        .base_url(BASE)
        .transport(transport)
        .rate_limits(RateLimits::none())
        .keep_alive(None)
}

pub async fn client(transport: Arc<MockTransport>, codes: Arc<FixedCode>, storage: Arc<InMemoryStorage>) -> Client {
    Client::connect(config(transport, codes, storage)).await.unwrap()
}
