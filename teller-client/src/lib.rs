//! # teller-client
//!
//! Async client for a session-authenticated bank web API that ships no SDK
//! of its own.
//!
//! ## Features
//! - Two wire protocols behind one engine: the result-code envelope of the
//!   web app's `common` API and the plain-JSON invest gateway
//! - Login through the API (phone, one-time code, password) or by driving the
//!   web login page in a remote browser
//! - Session cache with pluggable persistence: in-memory, JSON file, SQLite
//! - Per-endpoint sliding-window rate limits
//! - Retry with backoff on transport failures and provider throttling,
//!   one fresh login when the session loses its privileges
//! - Background keep-alive that drops a degraded session early
//! - Cancellation of every call through a [`CancellationToken`]
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use teller_client::{Client, Config, Credential, JsonFileStorage};
//! # use teller_client::ConfirmationProvider;
//! # async fn f(codes: Arc<dyn ConfirmationProvider>) -> Result<(), teller_client::ExchangeError> {
//!
//! let config = Config::new(
//!     Credential::new("+79990000000", "secret"),
//!     codes,
//!     Arc::new(JsonFileStorage::new("sessions.json")),
//! );
//! let client = Client::connect(config).await?;
//! for account in client.accounts_light_ib().await? {
//!     println!("{} {}", account.id, account.name);
//! }
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod auth;
mod context;
mod errors;
mod exchange;
mod invest;
mod keepalive;
mod lock;
mod retry;
mod session;
pub mod browser;
pub mod dto;
pub mod rate_limit;
pub mod session_backend;
pub mod transport;

pub use auth::{AuthFlow, CLIENT_ACCESS_LEVEL, ConfirmationProvider, Credential};
pub use browser::{BrowserAuthConfig, BrowserDriver, BrowserLauncher, BrowserStep, Element};
#[cfg(feature = "chrome")]
pub use browser::ChromeLauncher;
pub use context::CallContext;
pub use errors::{BrowserError, ExchangeError, InvestError, ResultCodeError, codes};
pub use exchange::{Auth, CommonExchange, ORIGIN, Response};
pub use invest::{DEFAULT_APP_NAME, DEFAULT_APP_VERSION, InvestExchange, InvestOperationIter};
pub use lock::{SessionLock, SessionLockGuard};
pub use rate_limit::{RateLimits, SlidingWindow};
pub use retry::{Backoff, RetryStrategy};
pub use session::{Session, SessionCache};
pub use session_backend::{InMemoryStorage, JsonFileStorage, SessionStorage};
#[cfg(feature = "sqlite-session")]
pub use session_backend::SqliteStorage;
pub use tokio_util::sync::CancellationToken;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};

use std::sync::Arc;
use std::time::Duration;

use dto::common::{Account, AccountsLightIbIn, Operation, OperationsIn, ShoppingReceipt, ShoppingReceiptIn};
use dto::invest::{
    InvestAccounts, InvestAccountsIn, InvestOperationTypes, InvestOperationTypesIn,
    InvestOperations, InvestOperationsIn,
};
use keepalive::KeepAlive;

/// Production API root.
pub const DEFAULT_BASE_URL: &str = "https://www.tinkoff.ru/api";

/// Default period of the session keep-alive probe.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

// ─── Config ───────────────────────────────────────────────────────────────────

/// Configuration for [`Client::connect`].
#[derive(Clone)]
pub struct Config {
    pub credential:         Credential,
    pub confirmation:       Arc<dyn ConfirmationProvider>,
    pub session_storage:    Arc<dyn SessionStorage>,
    pub base_url:           String,
    /// `None` builds a [`ReqwestTransport`] on connect.
    pub transport:          Option<Arc<dyn HttpTransport>>,
    pub auth_flow:          AuthFlow,
    pub rate_limits:        RateLimits,
    /// Keep-alive period; `None` disables the background probe.
    pub keep_alive:         Option<Duration>,
    pub invest_app_name:    String,
    pub invest_app_version: String,
}

impl Config {
    pub fn new(
        credential:      Credential,
        confirmation:    Arc<dyn ConfirmationProvider>,
        session_storage: Arc<dyn SessionStorage>,
    ) -> Self {
        Self {
            credential,
            confirmation,
            session_storage,
            base_url:           DEFAULT_BASE_URL.to_string(),
            transport:          None,
            auth_flow:          AuthFlow::Api,
            rate_limits:        RateLimits::standard(),
            keep_alive:         Some(DEFAULT_KEEP_ALIVE),
            invest_app_name:    DEFAULT_APP_NAME.to_string(),
            invest_app_version: DEFAULT_APP_VERSION.to_string(),
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn auth_flow(mut self, flow: AuthFlow) -> Self {
        self.auth_flow = flow;
        self
    }

    pub fn rate_limits(mut self, limits: RateLimits) -> Self {
        self.rate_limits = limits;
        self
    }

    pub fn keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval;
        self
    }

    pub fn invest_app_name(mut self, name: impl Into<String>) -> Self {
        self.invest_app_name = name.into();
        self
    }

    pub fn invest_app_version(mut self, version: impl Into<String>) -> Self {
        self.invest_app_version = version.into();
        self
    }

    /// Check the settings that would otherwise only fail on the first call.
    fn validate(&self) -> Result<String, ExchangeError> {
        if self.credential.phone.trim().is_empty() {
            return Err(ExchangeError::Config("phone must not be empty".into()));
        }
        if self.credential.password.is_empty() {
            return Err(ExchangeError::Config("password must not be empty".into()));
        }
        if let Some(interval) = self.keep_alive {
            if interval.is_zero() {
                return Err(ExchangeError::Config("keep-alive interval must be positive".into()));
            }
        }
        let url = url::Url::parse(&self.base_url)
            .map_err(|e| ExchangeError::Config(format!("invalid base url {:?}: {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ExchangeError::Config(format!("unsupported base url scheme {:?}", url.scheme())));
        }
        Ok(self.base_url.trim_end_matches('/').to_string())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("credential", &self.credential)
            .field("session_storage", &self.session_storage.name())
            .field("base_url", &self.base_url)
            .field("auth_flow", &self.auth_flow)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

/// State shared by both exchange engines, the auth flows and the keep-alive.
pub(crate) struct Engine {
    pub(crate) credential:         Credential,
    pub(crate) base_url:           String,
    pub(crate) transport:          Arc<dyn HttpTransport>,
    pub(crate) confirmation:       Arc<dyn ConfirmationProvider>,
    pub(crate) sessions:           SessionCache,
    pub(crate) rate_limits:        RateLimits,
    pub(crate) lock:               SessionLock,
    pub(crate) auth_flow:          AuthFlow,
    pub(crate) invest_app_name:    String,
    pub(crate) invest_app_version: String,
}

// ─── ClientInner ──────────────────────────────────────────────────────────────

struct ClientInner {
    engine:     Arc<Engine>,
    keep_alive: parking_lot::Mutex<Option<KeepAlive>>,
}

/// The API client. Cheap to clone, internally Arc-wrapped.
///
/// The keep-alive task stops when the last clone is dropped or on
/// [`Client::close`].
#[derive(Clone)]
pub struct Client {
    inner:  Arc<ClientInner>,
    cancel: CancellationToken,
}

impl Client {
    // ── Connect ────────────────────────────────────────────────────────────

    /// Build the client and start the keep-alive. No network traffic happens
    /// here; the first call (or the first keep-alive probe) loads the session.
    pub async fn connect(config: Config) -> Result<Self, ExchangeError> {
        let base_url = config.validate()?;
        let transport: Arc<dyn HttpTransport> = match config.transport {
            Some(t) => t,
            None    => Arc::new(ReqwestTransport::new()?),
        };

        tracing::info!(
            "[teller] Client for {} ({} sessions, {:?} login)",
            base_url, config.session_storage.name(), config.auth_flow,
        );

        let engine = Arc::new(Engine {
            credential:         config.credential,
            base_url,
            transport,
            confirmation:       config.confirmation,
            sessions:           SessionCache::new(config.session_storage),
            rate_limits:        config.rate_limits,
            lock:               SessionLock::new(),
            auth_flow:          config.auth_flow,
            invest_app_name:    config.invest_app_name,
            invest_app_version: config.invest_app_version,
        });

        let keep_alive = config.keep_alive.map(|interval| KeepAlive::start(Arc::clone(&engine), interval));

        Ok(Self {
            inner:  Arc::new(ClientInner { engine, keep_alive: parking_lot::Mutex::new(keep_alive) }),
            cancel: CancellationToken::new(),
        })
    }

    /// A clone whose calls are all abandoned once `token` is cancelled.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self { inner: Arc::clone(&self.inner), cancel: token }
    }

    /// Stop the keep-alive task. Calls keep working.
    pub fn close(&self) {
        if let Some(keep_alive) = self.inner.keep_alive.lock().take() {
            keep_alive.stop();
            tracing::debug!("[teller] Keep-alive stopped");
        }
    }

    fn ctx(&self) -> CallContext {
        CallContext::new(self.cancel.clone())
    }

    fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    // ── Session ────────────────────────────────────────────────────────────

    /// Probe the cached session. `false` when there is none or it lost its
    /// privileges; never starts a login.
    pub async fn is_authorized(&self) -> Result<bool, ExchangeError> {
        match self.engine().probe(&self.ctx()).await {
            Ok(())                         => Ok(true),
            Err(e) if e.is_unauthorized() => Ok(false),
            Err(e)                         => Err(e),
        }
    }

    /// Forget the cached session, both in memory and in storage.
    pub async fn sign_out(&self) -> Result<(), ExchangeError> {
        let ctx = self.ctx();
        let (_ctx, _guard) = self.engine().lock.acquire(&ctx).await?;
        self.engine().invalidate_session().await?;
        Ok(())
    }

    // ── Generic calls ──────────────────────────────────────────────────────

    /// Run a primary protocol call. `Ok(None)` means the provider answered
    /// `NO_DATA_FOUND`.
    pub async fn execute<E: CommonExchange>(&self, exchange: &E) -> Result<Option<Response<E::Out>>, ExchangeError> {
        self.engine().execute(exchange, &self.ctx()).await
    }

    /// Run a secondary protocol call.
    pub async fn execute_invest<E: InvestExchange>(&self, exchange: &E) -> Result<E::Out, ExchangeError> {
        self.engine().execute_invest(exchange, &self.ctx()).await
    }

    // ── Common API ─────────────────────────────────────────────────────────

    /// Every account of the signed-in client.
    pub async fn accounts_light_ib(&self) -> Result<Vec<Account>, ExchangeError> {
        Ok(self.execute(&AccountsLightIbIn).await?.map(|r| r.payload).unwrap_or_default())
    }

    /// Operations of one account within a time range.
    pub async fn operations(&self, query: &OperationsIn) -> Result<Vec<Operation>, ExchangeError> {
        Ok(self.execute(query).await?.map(|r| r.payload).unwrap_or_default())
    }

    /// The fiscal receipt of an operation, if the merchant sent one.
    pub async fn shopping_receipt(&self, query: &ShoppingReceiptIn) -> Result<Option<ShoppingReceipt>, ExchangeError> {
        Ok(self.execute(query).await?.map(|r| r.payload))
    }

    // ── Invest API ─────────────────────────────────────────────────────────

    pub async fn invest_operation_types(&self) -> Result<InvestOperationTypes, ExchangeError> {
        self.execute_invest(&InvestOperationTypesIn).await
    }

    /// Brokerage accounts with totals converted to `currency`.
    pub async fn invest_accounts(&self, currency: impl Into<String>) -> Result<InvestAccounts, ExchangeError> {
        self.execute_invest(&InvestAccountsIn::new(currency)).await
    }

    /// One page of brokerage operations; see [`Client::iter_invest_operations`].
    pub async fn invest_operations(&self, query: &InvestOperationsIn) -> Result<InvestOperations, ExchangeError> {
        self.execute_invest(query).await
    }

    /// Walk every brokerage operation matching `query`, page by page.
    pub fn iter_invest_operations(&self, query: InvestOperationsIn) -> InvestOperationIter {
        InvestOperationIter::new(query)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
