mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use serde::Serialize;
use serde_json::{Value, json};
use teller_client::dto::common::AccountsLightIbIn;
use teller_client::{
    Auth, CancellationToken, Client, CommonExchange, ConfirmationProvider, Config, Credential,
    ExchangeError, HttpResponse, Method, ORIGIN, RateLimits, SessionStorage, codes,
};
use tokio::sync::Notify;

const ACCOUNTS: &str = "/common/v1/accounts_light_ib";
const SESSION:  &str = "/common/v1/session";
const ANON:     &str = "/common/v1/anon";

#[derive(Serialize)]
struct Whoami;

impl CommonExchange for Whoami {
    type Out = Value;
    fn path(&self) -> &'static str { "/common/v1/whoami" }
    fn auth(&self) -> Auth { Auth::Check }
}

#[derive(Serialize)]
struct Anonymous;

impl CommonExchange for Anonymous {
    type Out = Value;
    fn path(&self) -> &'static str { ANON }
    fn auth(&self) -> Auth { Auth::None }
}

/// Holds the login at the code prompt until released.
#[derive(Default)]
struct GatedCode {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ConfirmationProvider for GatedCode {
    async fn confirmation_code(&self, _phone: &str) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok("1234".to_string())
    }
}

#[tokio::test]
async fn ok_envelope_decodes_payload() {
    let transport = MockTransport::new(|req, _| match req.path.as_str() {
        ACCOUNTS => Ok(ok(json!([{ "id": "a1", "name": "Black", "accountType": "Current" }]))),
        other    => panic!("unexpected call to {other}"),
    });
    let client = client(transport.clone(), Arc::default(), storage_with(Some("S0")).await).await;

    let accounts = client.accounts_light_ib().await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].id, "a1");
    assert_eq!(accounts[0].account_type, "Current");

    let sent = transport.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, Method::Post);
    assert_eq!(sent[0].url, format!("{BASE}{ACCOUNTS}"));
    assert_eq!(sent[0].query_param("origin"), Some(ORIGIN));
    assert_eq!(sent[0].query_param("sessionid"), Some("S0"));
}

#[tokio::test]
async fn no_data_found_is_an_empty_result() {
    let transport = MockTransport::new(|_, _| Ok(envelope(codes::NO_DATA_FOUND, Value::Null)));
    let client = client(transport.clone(), Arc::default(), storage_with(Some("S0")).await).await;

    assert!(client.execute(&AccountsLightIbIn).await.unwrap().is_none());
    assert!(client.accounts_light_ib().await.unwrap().is_empty());
    assert_eq!(transport.count(ACCOUNTS), 2, "no-data is never retried");
}

#[tokio::test]
async fn missing_session_triggers_one_login() {
    let transport = MockTransport::new(|req, _| {
        if let Some(response) = login(req) {
            return Ok(response);
        }
        assert_eq!(req.query_param("sessionid"), Some(FRESH));
        Ok(ok(json!([])))
    });
    let codes = Arc::new(FixedCode::default());
    let storage = storage_with(None).await;
    let client = client(transport.clone(), codes.clone(), storage.clone()).await;

    client.accounts_light_ib().await.unwrap();

    let paths: Vec<String> = transport.requests().into_iter().map(|r| r.path).collect();
    assert_eq!(paths, [
        SESSION,
        "/common/v1/sign_up",
        "/common/v1/confirm",
        "/common/v1/sign_up",
        "/common/v1/level_up",
        ACCOUNTS,
    ]);
    assert_eq!(codes.calls(), 1);

    // the anonymous session call carries no session, the rest the pending one
    let sent = transport.requests();
    assert_eq!(sent[0].query_param("sessionid"), None);
    assert!(sent[1..].iter().all(|r| r.query_param("sessionid") == Some(FRESH)));

    let confirm = transport.to("/common/v1/confirm").remove(0).form_pairs();
    assert!(confirm.contains(&("initialOperation".into(), "sign_up".into())));
    assert!(confirm.contains(&("initialOperationTicket".into(), "T-1".into())));
    assert!(confirm.contains(&("confirmationData".into(), r#"{"SMSBYID":"1234"}"#.into())));

    let stored = storage.load(PHONE).await.unwrap().unwrap();
    assert_eq!(stored.id, FRESH);
}

#[tokio::test]
async fn insufficient_privileges_reauthorizes_exactly_once() {
    let transport = MockTransport::new(|req, _| match login(req) {
        Some(response) => Ok(response),
        None           => Ok(envelope(codes::INSUFFICIENT_PRIVILEGES, Value::Null)),
    });
    let codes = Arc::new(FixedCode::default());
    let client = client(transport.clone(), codes.clone(), storage_with(Some("stale")).await).await;

    let err = tokio::time::timeout(Duration::from_secs(5), client.accounts_light_ib())
        .await
        .expect("re-authentication must not loop or deadlock")
        .unwrap_err();

    assert!(err.is(codes::INSUFFICIENT_PRIVILEGES), "got {err}");
    assert_eq!(transport.count(SESSION), 1, "exactly one login");
    assert_eq!(codes.calls(), 1);
    assert_eq!(transport.count(ACCOUNTS), 2, "exactly one retry");

    let accounts = transport.to(ACCOUNTS);
    assert_eq!(accounts[0].query_param("sessionid"), Some("stale"));
    assert_eq!(accounts[1].query_param("sessionid"), Some(FRESH));
}

#[tokio::test]
async fn reauthorized_retry_can_succeed() {
    let transport = MockTransport::new(|req, n| match login(req) {
        Some(response)     => Ok(response),
        None if n == 0     => Ok(envelope(codes::INSUFFICIENT_PRIVILEGES, Value::Null)),
        None               => Ok(ok(json!([{ "id": "a1" }]))),
    });
    let client = client(transport.clone(), Arc::default(), storage_with(Some("stale")).await).await;

    let accounts = client.accounts_light_ib().await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(transport.count(ACCOUNTS), 2);
}

#[tokio::test]
async fn concurrent_callers_share_one_login() {
    let transport = MockTransport::new(|req, _| Ok(login(req).unwrap_or_else(|| ok(json!([])))));
    let codes = Arc::new(FixedCode::default());
    let client = client(transport.clone(), codes.clone(), storage_with(None).await).await;

    let (a, b) = tokio::join!(client.accounts_light_ib(), client.accounts_light_ib());
    a.unwrap();
    b.unwrap();

    assert_eq!(transport.count(SESSION), 1);
    assert_eq!(codes.calls(), 1);
    assert_eq!(transport.count(ACCOUNTS), 2);
}

#[tokio::test(start_paused = true)]
async fn transport_failures_are_retried() {
    let transport = MockTransport::new(|_, n| match n {
        0 => Err(ExchangeError::Transport("connection reset".into())),
        1 => Ok(HttpResponse::new(502, "<html>bad gateway</html>")),
        _ => Ok(ok(json!([{ "id": "a1" }]))),
    });
    let client = client(transport.clone(), Arc::default(), storage_with(Some("S0")).await).await;

    let accounts = client.accounts_light_ib().await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(transport.count(ACCOUNTS), 3);
}

#[tokio::test(start_paused = true)]
async fn provider_rate_limit_gives_up_after_five_retries() {
    let transport = MockTransport::new(|_, _| Ok(envelope(codes::REQUEST_RATE_LIMIT_EXCEEDED, Value::Null)));
    let client = client(transport.clone(), Arc::default(), storage_with(Some("S0")).await).await;

    let started = tokio::time::Instant::now();
    let err = client.accounts_light_ib().await.unwrap_err();

    // the original rejection, not a generic "too many retries"
    assert_eq!(err.result_code(), Some(codes::REQUEST_RATE_LIMIT_EXCEEDED));
    assert_eq!(transport.count(ACCOUNTS), 6);
    // 60 + 120 + 240 + 480 + 960 seconds before jitter
    assert!(started.elapsed() >= Duration::from_secs(1860));
}

#[tokio::test]
async fn unknown_result_code_is_terminal() {
    let transport = MockTransport::new(|_, _| Ok(envelope("INTERNAL_ERROR", Value::Null)));
    let client = client(transport.clone(), Arc::default(), storage_with(Some("S0")).await).await;

    match client.accounts_light_ib().await {
        Err(ExchangeError::ResultCode(e)) => {
            assert_eq!(e.expected, "OK");
            assert_eq!(e.actual, "INTERNAL_ERROR");
            assert_eq!(e.message, "provider says no");
        }
        other => panic!("expected a result code error, got {other:?}"),
    }
    assert_eq!(transport.count(ACCOUNTS), 1);
}

#[tokio::test]
async fn check_without_session_fails_fast() {
    let transport = MockTransport::new(|req, _| panic!("unexpected call to {}", req.path));
    let client = client(transport.clone(), Arc::default(), storage_with(None).await).await;

    assert!(matches!(client.execute(&Whoami).await, Err(ExchangeError::Unauthorized)));
    assert!(!client.is_authorized().await.unwrap());
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn degraded_access_level_is_not_authorized() {
    let transport = MockTransport::new(|_, n| match n {
        0 => Ok(ok(json!({ "accessLevel": "CLIENT" }))),
        _ => Ok(ok(json!({ "accessLevel": "ANONYMOUS" }))),
    });
    let client = client(transport.clone(), Arc::default(), storage_with(Some("S0")).await).await;

    assert!(client.is_authorized().await.unwrap());
    assert!(!client.is_authorized().await.unwrap());
}

#[tokio::test]
async fn sign_out_clears_storage() {
    let transport = MockTransport::new(|req, _| panic!("unexpected call to {}", req.path));
    let storage = storage_with(Some("S0")).await;
    let client = client(transport, Arc::default(), storage.clone()).await;

    client.sign_out().await.unwrap();
    assert!(storage.load(PHONE).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_backoff() {
    let transport = MockTransport::new(|_, _| Ok(HttpResponse::new(503, "")));
    let client = client(transport.clone(), Arc::default(), storage_with(Some("S0")).await).await;

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
    });

    let err = client.with_cancellation(token).accounts_light_ib().await.unwrap_err();
    assert!(err.is_cancelled(), "got {err}");
    assert!(transport.count(ACCOUNTS) >= 2);
}

#[tokio::test]
async fn cancelled_token_stops_before_the_network() {
    let transport = MockTransport::new(|req, _| panic!("unexpected call to {}", req.path));
    let client = client(transport, Arc::default(), storage_with(Some("S0")).await).await;

    let token = CancellationToken::new();
    token.cancel();
    let err = client.with_cancellation(token).accounts_light_ib().await.unwrap_err();
    assert!(matches!(err, ExchangeError::Cancelled));
}

#[tokio::test]
async fn failed_login_is_wrapped_and_leaves_no_session() {
    let transport = MockTransport::new(|req, _| match req.path.as_str() {
        "/common/v1/sign_up" => Ok(envelope("INVALID_REQUEST_DATA", Value::Null)),
        _                    => Ok(login(req).unwrap_or_else(|| ok(json!([])))),
    });
    let storage = storage_with(None).await;
    let client = client(transport.clone(), Arc::default(), storage.clone()).await;

    match client.accounts_light_ib().await {
        Err(ExchangeError::Auth { step, source }) => {
            assert_eq!(step, "phone sign up");
            assert_eq!(source.result_code(), Some("INVALID_REQUEST_DATA"));
        }
        other => panic!("expected an auth error, got {other:?}"),
    }
    assert!(storage.load(PHONE).await.unwrap().is_none());
    assert_eq!(transport.count(ACCOUNTS), 0);
}

#[tokio::test]
async fn sign_up_without_ticket_fails_before_asking_for_a_code() {
    let transport = MockTransport::new(|req, _| match req.path.as_str() {
        "/common/v1/sign_up" => Ok(HttpResponse::new(200, json!({
            "resultCode": "WAITING_CONFIRMATION",
        }).to_string())),
        _ => Ok(login(req).unwrap_or_else(|| ok(json!([])))),
    });
    let codes = Arc::new(FixedCode::default());
    let storage = storage_with(None).await;
    let client = client(transport.clone(), codes.clone(), storage.clone()).await;

    match client.accounts_light_ib().await {
        Err(ExchangeError::Auth { step, source }) => {
            assert_eq!(step, "phone sign up");
            assert!(matches!(*source, ExchangeError::MissingPayload(ref p) if p == "/common/v1/sign_up"), "got {source}");
        }
        other => panic!("expected an auth error, got {other:?}"),
    }
    assert_eq!(codes.calls(), 0, "no code is asked for without a ticket");
    assert_eq!(transport.count("/common/v1/confirm"), 0);
    assert!(storage.load(PHONE).await.unwrap().is_none());
}

#[tokio::test]
async fn anonymous_call_signs_in_again_under_the_lock() {
    let transport = MockTransport::new(|req, n| match req.path.as_str() {
        ANON if n == 0 => Ok(envelope(codes::INSUFFICIENT_PRIVILEGES, Value::Null)),
        ANON           => Ok(ok(json!("anon"))),
        _              => Ok(login(req).unwrap_or_else(|| ok(json!([])))),
    });
    let gate = Arc::new(GatedCode::default());
    let config = Config::new(Credential::new(PHONE, PASSWORD), gate.clone(), storage_with(Some("S0")).await)
        .base_url(BASE)
        .transport(transport.clone())
        .rate_limits(RateLimits::none())
        .keep_alive(None);
    let client = Client::connect(config).await.unwrap();

    let background = client.clone();
    let anon = tokio::spawn(async move { background.execute(&Anonymous).await });
    gate.entered.notified().await;

    // the login is waiting for its code and holds the session lock
    let blocked = tokio::time::timeout(Duration::from_millis(200), client.accounts_light_ib()).await;
    assert!(blocked.is_err(), "an authenticated call must wait for the login in progress");
    assert_eq!(transport.count(ACCOUNTS), 0);

    gate.release.notify_one();
    let out = anon.await.unwrap().unwrap().unwrap();
    assert_eq!(out.payload, json!("anon"));

    client.accounts_light_ib().await.unwrap();
    let accounts = transport.to(ACCOUNTS);
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].query_param("sessionid"), Some(FRESH));
}
