//! Secondary protocol: query-encoded GET with plain JSON bodies.
//!
//! Success is HTTP 200 with the payload as the whole body. Failures are a 4xx
//! or 5xx status with `{"errorMessage": ..., "errorCode": ...}`.
//!
//! An expired session is reported as error code `"404"`, the same code used
//! for genuinely missing resources. On that code the engine probes the session
//! and signs in again only if the probe rejects it. Other errors are returned
//! as they are, and so is a missing response: only the primary engine retries
//! transport failures.

use std::collections::{HashSet, VecDeque};
use std::ops::ControlFlow;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::CallContext;
use crate::dto::invest::{InvestOperation, InvestOperationsIn};
use crate::errors::{ExchangeError, InvestError};
use crate::exchange::ellipsis;
use crate::retry::RetryStrategy;
use crate::transport::{HttpRequest, Method};
use crate::{Client, Engine};

pub const DEFAULT_APP_NAME:    &str = "invest";
pub const DEFAULT_APP_VERSION: &str = "1.328.0";

/// A secondary protocol call. The value itself is the query string.
pub trait InvestExchange: Serialize + Send + Sync {
    type Out: DeserializeOwned + Send;

    fn path(&self) -> &'static str;
}

impl Engine {
    /// Execute a secondary call; always requires a session.
    pub(crate) async fn execute_invest<E: InvestExchange>(
        &self,
        exchange: &E,
        ctx:      &CallContext,
    ) -> Result<E::Out, ExchangeError> {
        let path = exchange.path();
        let encoded = serde_urlencoded::to_string(exchange)
            .map_err(|e| ExchangeError::Encode { path: path.to_string(), message: e.to_string() })?;
        let params: Vec<(String, String)> = serde_urlencoded::from_str(&encoded)
            .map_err(|e| ExchangeError::Encode { path: path.to_string(), message: e.to_string() })?;

        let (mut ctx, _guard) = self.lock.acquire(ctx).await?;
        loop {
            let session = self.ensure_session(&ctx).await?;

            let mut query = params.clone();
            query.push(("sessionId".to_string(), session.id));
            let request = HttpRequest {
                method:  Method::Get,
                url:     format!("{}{path}", self.base_url),
                path:    path.to_string(),
                query,
                headers: vec![
                    ("X-App-Name".to_string(), self.invest_app_name.clone()),
                    ("X-App-Version".to_string(), self.invest_app_version.clone()),
                ],
                form:    None,
            };

            tracing::debug!("[teller] GET {path}");
            let response = ctx.run(self.transport.send(request)).await??;

            let failure = match response.status {
                200 => {
                    return serde_json::from_str(&response.body)
                        .map_err(|e| ExchangeError::Decode { path: path.to_string(), message: e.to_string() });
                }
                400..=599 => match serde_json::from_str::<InvestError>(&response.body) {
                    Ok(e) if !e.code.is_empty() || !e.message.is_empty() => e,
                    _ => return Err(ExchangeError::Http { status: response.status, body: ellipsis(&response.body) }),
                },
                status => return Err(ExchangeError::Http { status, body: ellipsis(&response.body) }),
            };

            // heuristic: "404" may just as well be a missing resource
            if !failure.is_not_found() || RetryStrategy::REAUTHORIZE.is_exhausted(&ctx) {
                return Err(failure.into());
            }
            match self.probe(&ctx.fork()).await {
                Err(e) if e.is_unauthorized() => {}
                Err(e) if e.is_cancelled()    => return Err(e),
                _                             => return Err(failure.into()),
            }

            tracing::info!("[teller] {path}: session rejected, signing in again");
            self.sessions.invalidate(&self.credential.phone).await?;
            self.authorize(&ctx.fork()).await?;

            match RetryStrategy::REAUTHORIZE.wait(&ctx).await? {
                ControlFlow::Continue(next) => ctx = next,
                ControlFlow::Break(())      => return Err(failure.into()),
            }
        }
    }
}

// ─── InvestOperationIter ──────────────────────────────────────────────────────

/// Cursor-paginated iterator over brokerage operations.
///
/// # Example
/// ```rust,no_run
/// # async fn f(client: teller_client::Client) -> Result<(), teller_client::ExchangeError> {
/// use teller_client::dto::invest::InvestOperationsIn;
///
/// let mut iter = client.iter_invest_operations(InvestOperationsIn::default());
/// while let Some(op) = iter.next(&client).await? {
///     println!("{} {}", op.date, op.description);
/// }
/// # Ok(()) }
/// ```
pub struct InvestOperationIter {
    query:     InvestOperationsIn,
    buffer:    VecDeque<InvestOperation>,
    /// Every cursor sent so far; a repeat would page forever.
    seen:      HashSet<String>,
    exhausted: bool,
}

impl InvestOperationIter {
    pub(crate) fn new(query: InvestOperationsIn) -> Self {
        let seen = query.cursor.iter().cloned().collect();
        Self { query, buffer: VecDeque::new(), seen, exhausted: false }
    }

    /// Fetch the next operation, or `None` when all pages are consumed.
    pub async fn next(&mut self, client: &Client) -> Result<Option<InvestOperation>, ExchangeError> {
        loop {
            if let Some(op) = self.buffer.pop_front() {
                return Ok(Some(op));
            }
            if self.exhausted {
                return Ok(None);
            }

            let page = client.invest_operations(&self.query).await?;
            self.buffer.extend(page.items);
            if !page.has_next || page.next_cursor.is_empty() {
                self.exhausted = true;
            } else if !self.seen.insert(page.next_cursor.clone()) {
                tracing::warn!("[teller] invest operations: cursor {:?} repeated, stopping", page.next_cursor);
                self.exhausted = true;
            } else {
                self.query.cursor = Some(page.next_cursor);
            }
        }
    }

    /// Collect every remaining operation.
    pub async fn collect(mut self, client: &Client) -> Result<Vec<InvestOperation>, ExchangeError> {
        let mut out = Vec::new();
        while let Some(op) = self.next(client).await? {
            out.push(op);
        }
        Ok(out)
    }
}
