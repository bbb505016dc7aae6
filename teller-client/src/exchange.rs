//! Primary protocol: form-encoded POST against a result-code envelope.
//!
//! ```text
//! POST {base}/common/v1/...?origin=web,ib5,platform&sessionid=...
//! {"resultCode": "OK", "errorMessage": "", "payload": ..., "operationTicket": ""}
//! ```
//!
//! A call descriptor ([`CommonExchange`]) names the path, the auth level and
//! the result code that means success. Every other code is classified:
//!
//! | result code                   | reaction                                  |
//! |-------------------------------|-------------------------------------------|
//! | `NO_DATA_FOUND`               | `Ok(None)`, never retried                 |
//! | `REQUEST_RATE_LIMIT_EXCEEDED` | [`RetryStrategy::PROVIDER_RATE_LIMIT`]    |
//! | `INSUFFICIENT_PRIVILEGES`     | one login, then one immediate retry       |
//! | anything else                 | [`ExchangeError::ResultCode`]             |
//!
//! A non-200 status or a missing response is retried forever with
//! [`RetryStrategy::TRANSPORT`], unless the descriptor opts out.

use std::ops::ControlFlow;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::CallContext;
use crate::errors::{ExchangeError, ResultCodeError, codes};
use crate::retry::RetryStrategy;
use crate::transport::{HttpRequest, Method};
use crate::Engine;

/// Fixed client-origin marker sent with every primary call.
pub const ORIGIN: &str = "web,ib5,platform";

/// Error bodies quoted in errors are cut to this many characters.
const ELLIPSIS_AT: usize = 200;

// ─── Descriptor ───────────────────────────────────────────────────────────────

/// How a call obtains its session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Auth {
    /// Anonymous; bypasses the session lock.
    None,
    /// Use the cached session, fail with [`ExchangeError::Unauthorized`] if
    /// there is none.
    Check,
    /// Use the cached session, logging in first if there is none.
    Force,
}

/// A primary protocol call. The value itself is the form body.
pub trait CommonExchange: Serialize + Send + Sync {
    type Out: DeserializeOwned + Send;

    fn path(&self) -> &'static str;

    fn auth(&self) -> Auth { Auth::Force }

    /// The result code that means success.
    fn expected_code(&self) -> &'static str { codes::OK }

    /// Whether `INSUFFICIENT_PRIVILEGES` may trigger a fresh login.
    fn reauthorize(&self) -> bool { true }

    /// Whether transport failures are retried. When `false` the first one is
    /// returned as it is.
    fn retry_transport(&self) -> bool { true }
}

/// A successful primary call.
#[derive(Clone, Debug, PartialEq)]
pub struct Response<R> {
    pub payload:          R,
    pub operation_ticket: Option<String>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    result_code:      String,
    #[serde(default)]
    error_message:    Option<String>,
    #[serde(default)]
    payload:          Option<Value>,
    #[serde(default)]
    operation_ticket: Option<String>,
}

/// Outcome of one network attempt.
enum Attempt<R> {
    Done(Response<R>),
    NoData,
    Retry(ExchangeError, RetryStrategy),
}

pub(crate) fn ellipsis(body: &str) -> String {
    match body.char_indices().nth(ELLIPSIS_AT) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None           => body.to_string(),
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

impl Engine {
    /// Execute a primary call. `Ok(None)` means `NO_DATA_FOUND`.
    pub(crate) async fn execute<E: CommonExchange>(
        &self,
        exchange: &E,
        ctx:      &CallContext,
    ) -> Result<Option<Response<E::Out>>, ExchangeError> {
        let path = exchange.path();
        let form = serde_urlencoded::to_string(exchange)
            .map_err(|e| ExchangeError::Encode { path: path.to_string(), message: e.to_string() })?;

        let auth = exchange.auth();
        let (mut ctx, _guard) = match auth {
            Auth::None => (ctx.clone(), None),
            Auth::Check | Auth::Force => {
                let (ctx, guard) = self.lock.acquire(ctx).await?;
                (ctx, Some(guard))
            }
        };

        loop {
            let session_id = match auth {
                Auth::None  => None,
                Auth::Check => Some(self.current_session(&ctx).await?.ok_or(ExchangeError::Unauthorized)?.id),
                Auth::Force => Some(self.ensure_session(&ctx).await?.id),
            };

            let (failure, strategy) = match self.attempt(exchange, path, &form, session_id, &ctx).await? {
                Attempt::Done(response)      => return Ok(Some(response)),
                Attempt::NoData              => return Ok(None),
                Attempt::Retry(err, retry)   => (err, retry),
            };

            if strategy == RetryStrategy::TRANSPORT && !exchange.retry_transport() {
                return Err(failure);
            }
            if strategy == RetryStrategy::REAUTHORIZE {
                if !exchange.reauthorize() || strategy.is_exhausted(&ctx) {
                    return Err(failure);
                }
                tracing::info!("[teller] {path}: insufficient privileges, signing in again");
                // anonymous calls run unlocked, but the login itself never does
                let (login_ctx, _login_guard) = self.lock.acquire(&ctx).await?;
                self.authorize(&login_ctx.fork()).await?;
            }

            match strategy.wait(&ctx).await? {
                ControlFlow::Continue(next) => ctx = next,
                ControlFlow::Break(())      => return Err(failure),
            }
        }
    }

    /// One rate-limited round trip. The permit is released on return, before
    /// any backoff.
    async fn attempt<E: CommonExchange>(
        &self,
        exchange:   &E,
        path:       &'static str,
        form:       &str,
        session_id: Option<String>,
        ctx:        &CallContext,
    ) -> Result<Attempt<E::Out>, ExchangeError> {
        let _permit = self.rate_limits.acquire(path, ctx).await?;

        let mut query = vec![("origin".to_string(), ORIGIN.to_string())];
        if let Some(id) = session_id {
            query.push(("sessionid".to_string(), id));
        }
        let request = HttpRequest {
            method:  Method::Post,
            url:     format!("{}{path}", self.base_url),
            path:    path.to_string(),
            query,
            headers: Vec::new(),
            form:    Some(form.to_string()),
        };

        tracing::debug!("[teller] POST {path}");
        let response = match ctx.run(self.transport.send(request)).await? {
            Ok(r)  => r,
            Err(e @ ExchangeError::Transport(_)) => {
                tracing::warn!("[teller] {path}: {e}");
                return Ok(Attempt::Retry(e, RetryStrategy::TRANSPORT));
            }
            Err(e) => return Err(e),
        };

        if response.status != 200 {
            tracing::warn!("[teller] {path}: HTTP {}", response.status);
            let err = ExchangeError::Http { status: response.status, body: ellipsis(&response.body) };
            return Ok(Attempt::Retry(err, RetryStrategy::TRANSPORT));
        }

        let envelope: Envelope = serde_json::from_str(&response.body)
            .map_err(|e| ExchangeError::Decode { path: path.to_string(), message: e.to_string() })?;

        let expected = exchange.expected_code();
        if envelope.result_code == expected {
            let payload = match envelope.payload {
                Some(payload) => serde_json::from_value(payload)
                    .map_err(|e| ExchangeError::Decode { path: path.to_string(), message: e.to_string() })?,
                // fine for `Value` and `Option` payloads, an error for anything else
                None => serde_json::from_value(Value::Null)
                    .map_err(|_| ExchangeError::MissingPayload(path.to_string()))?,
            };
            let operation_ticket = envelope.operation_ticket.filter(|t| !t.is_empty());
            return Ok(Attempt::Done(Response { payload, operation_ticket }));
        }

        let failure = ExchangeError::ResultCode(ResultCodeError {
            expected: expected.to_string(),
            actual:   envelope.result_code.clone(),
            message:  envelope.error_message.unwrap_or_default(),
        });
        match envelope.result_code.as_str() {
            codes::NO_DATA_FOUND => Ok(Attempt::NoData),
            codes::REQUEST_RATE_LIMIT_EXCEEDED => {
                tracing::warn!("[teller] {path}: {failure}");
                Ok(Attempt::Retry(failure, RetryStrategy::PROVIDER_RATE_LIMIT))
            }
            codes::INSUFFICIENT_PRIVILEGES => Ok(Attempt::Retry(failure, RetryStrategy::REAUTHORIZE)),
            _ => Err(failure),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
