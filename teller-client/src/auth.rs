//! Login flows and session resolution.
//!
//! [`AuthFlow::Api`] performs the web app's own login sequence through the
//! primary engine:
//!
//! 1. `session`: obtain a fresh anonymous session id
//! 2. `sign_up` with the phone, expecting `WAITING_CONFIRMATION` and a ticket
//! 3. `confirm` the ticket with the code from the [`ConfirmationProvider`]
//! 4. `sign_up` with the password
//! 5. `level_up` to full client privileges
//!
//! Steps 2–5 run at `Auth::Check` against the pending session carried in the
//! call context, so nothing is stored until the whole flow succeeded.
//!
//! [`AuthFlow::Browser`] drives the web login page instead, see
//! [`crate::browser`].

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::Serialize;

use crate::browser::BrowserAuthConfig;
use crate::context::CallContext;
use crate::dto::encode;
use crate::errors::{ExchangeError, codes};
use crate::exchange::{Auth, CommonExchange};
use crate::session::Session;
use crate::Engine;

/// `accessLevel` of a fully signed-in session.
pub const CLIENT_ACCESS_LEVEL: &str = "CLIENT";

// ─── Credential ───────────────────────────────────────────────────────────────

/// Phone number and password. The phone also keys the session storage.
#[derive(Clone)]
pub struct Credential {
    pub phone:    String,
    pub password: String,
}

impl Credential {
    pub fn new(phone: impl Into<String>, password: impl Into<String>) -> Self {
        Self { phone: phone.into(), password: password.into() }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("phone", &self.phone)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ─── ConfirmationProvider ─────────────────────────────────────────────────────

/// Supplies the one-time code the provider sends during login.
///
/// May take arbitrarily long (a human reading an SMS). The call is abandoned
/// when the caller's cancellation token fires.
#[async_trait]
pub trait ConfirmationProvider: Send + Sync {
    async fn confirmation_code(&self, phone: &str) -> Result<String, Box<dyn StdError + Send + Sync>>;
}

// ─── AuthFlow ─────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub enum AuthFlow {
    /// Programmatic login through the primary protocol.
    #[default]
    Api,
    /// Drive the web login page with a remote browser.
    Browser(BrowserAuthConfig),
}

impl fmt::Debug for AuthFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api        => f.write_str("Api"),
            Self::Browser(c) => write!(f, "Browser({})", c.login_url),
        }
    }
}

// ─── Auth-flow descriptors ────────────────────────────────────────────────────

#[derive(Serialize)]
struct SessionIn;

impl CommonExchange for SessionIn {
    type Out = String;
    fn path(&self) -> &'static str { "/common/v1/session" }
    fn auth(&self) -> Auth { Auth::None }
    fn reauthorize(&self) -> bool { false }
}

#[derive(Serialize)]
struct PhoneSignUpIn<'a> {
    phone: &'a str,
}

impl CommonExchange for PhoneSignUpIn<'_> {
    type Out = serde_json::Value;
    fn path(&self) -> &'static str { "/common/v1/sign_up" }
    fn auth(&self) -> Auth { Auth::Check }
    fn expected_code(&self) -> &'static str { codes::WAITING_CONFIRMATION }
    fn reauthorize(&self) -> bool { false }
}

#[derive(Serialize)]
struct ConfirmationData<'a> {
    #[serde(rename = "SMSBYID")]
    sms_by_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmIn<'a> {
    initial_operation:        &'static str,
    initial_operation_ticket: &'a str,
    #[serde(serialize_with = "encode::json_string")]
    confirmation_data:        ConfirmationData<'a>,
}

impl CommonExchange for ConfirmIn<'_> {
    type Out = serde_json::Value;
    fn path(&self) -> &'static str { "/common/v1/confirm" }
    fn auth(&self) -> Auth { Auth::Check }
    fn reauthorize(&self) -> bool { false }
}

#[derive(Serialize)]
struct PasswordSignUpIn<'a> {
    password: &'a str,
}

impl CommonExchange for PasswordSignUpIn<'_> {
    type Out = serde_json::Value;
    fn path(&self) -> &'static str { "/common/v1/sign_up" }
    fn auth(&self) -> Auth { Auth::Check }
    fn reauthorize(&self) -> bool { false }
}

#[derive(Serialize)]
struct LevelUpIn;

impl CommonExchange for LevelUpIn {
    type Out = serde_json::Value;
    fn path(&self) -> &'static str { "/common/v1/level_up" }
    fn auth(&self) -> Auth { Auth::Check }
    fn reauthorize(&self) -> bool { false }
}

#[derive(Default, Serialize)]
struct PingIn {
    #[serde(skip)]
    single_attempt: bool,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PingOut {
    #[serde(default)]
    access_level: String,
}

impl CommonExchange for PingIn {
    type Out = PingOut;
    fn path(&self) -> &'static str { "/common/v1/ping" }
    fn auth(&self) -> Auth { Auth::Check }
    fn reauthorize(&self) -> bool { false }
    fn retry_transport(&self) -> bool { !self.single_attempt }
}

// ─── Engine: session resolution ───────────────────────────────────────────────

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

impl Engine {
    /// The session the next call should use: the pending one of an auth flow
    /// in progress, otherwise the cached one.
    pub(crate) async fn current_session(&self, ctx: &CallContext) -> Result<Option<Session>, ExchangeError> {
        if let Some(session) = ctx.session() {
            return Ok(Some(session.clone()));
        }
        Ok(self.sessions.resolve(&self.credential.phone).await?)
    }

    /// Like [`Self::current_session`], but logs in when there is none.
    pub(crate) async fn ensure_session(&self, ctx: &CallContext) -> Result<Session, ExchangeError> {
        match self.current_session(ctx).await? {
            Some(session) => Ok(session),
            None          => self.authorize(&ctx.fork()).await,
        }
    }

    /// Run the configured login flow and store its session. On failure the
    /// cached session is dropped, since the provider may have revoked it.
    ///
    /// Boxed because the flow re-enters [`Engine::execute`].
    pub(crate) fn authorize<'a>(&'a self, ctx: &'a CallContext) -> BoxFuture<'a, Result<Session, ExchangeError>> {
        Box::pin(async move {
            tracing::info!("[teller/auth] Signing in ({})", match self.auth_flow {
                AuthFlow::Api        => "api",
                AuthFlow::Browser(_) => "browser",
            });

            let outcome = match &self.auth_flow {
                AuthFlow::Api            => self.api_flow(ctx).await,
                AuthFlow::Browser(config) => {
                    crate::browser::authorize(config, &self.credential, self.confirmation.as_ref(), ctx).await
                }
            };

            match outcome {
                Ok(session) => {
                    self.sessions.store(&self.credential.phone, session.clone()).await?;
                    tracing::info!("[teller/auth] Signed in");
                    Ok(session)
                }
                Err(e) => {
                    if let Err(reset) = self.sessions.invalidate(&self.credential.phone).await {
                        tracing::warn!("[teller/auth] Failed to drop session after failed login: {reset}");
                    }
                    Err(e)
                }
            }
        })
    }

    async fn api_flow(&self, ctx: &CallContext) -> Result<Session, ExchangeError> {
        let session = self.execute(&SessionIn, ctx).await
            .and_then(|r| r.ok_or_else(|| ExchangeError::MissingPayload("/common/v1/session".into())))
            .map_err(|e| e.in_step("get new session"))?;
        let session = Session::new(session.payload);
        let ctx = ctx.with_session(session.clone());

        let phone = &self.credential.phone;
        let ticket = self.execute(&PhoneSignUpIn { phone }, &ctx.fork()).await
            .and_then(|r| r.and_then(|r| r.operation_ticket)
                .ok_or_else(|| ExchangeError::MissingPayload("/common/v1/sign_up".into())))
            .map_err(|e| e.in_step("phone sign up"))?;

        let code = request_code(self.confirmation.as_ref(), phone, &ctx).await?;
        self.execute(&ConfirmIn {
            initial_operation:        "sign_up",
            initial_operation_ticket: &ticket,
            confirmation_data:        ConfirmationData { sms_by_id: &code },
        }, &ctx.fork()).await
            .map_err(|e| e.in_step("submit confirmation code"))?;

        self.execute(&PasswordSignUpIn { password: &self.credential.password }, &ctx.fork()).await
            .map_err(|e| e.in_step("password sign up"))?;

        self.execute(&LevelUpIn, &ctx.fork()).await
            .map_err(|e| e.in_step("level up"))?;

        Ok(session)
    }

    /// Lightweight validity check of the current session.
    ///
    /// `Err(Unauthorized)` when there is no session, the provider rejects it,
    /// or it lacks full client privileges.
    pub(crate) async fn probe(&self, ctx: &CallContext) -> Result<(), ExchangeError> {
        self.ping(&PingIn::default(), ctx).await
    }

    /// [`Self::probe`] without transport retries: a network failure is
    /// returned right away instead of holding the session lock through the
    /// backoff.
    pub(crate) async fn probe_once(&self, ctx: &CallContext) -> Result<(), ExchangeError> {
        self.ping(&PingIn { single_attempt: true }, ctx).await
    }

    async fn ping(&self, ping: &PingIn, ctx: &CallContext) -> Result<(), ExchangeError> {
        match self.execute(ping, ctx).await {
            Ok(Some(r)) if r.payload.access_level == CLIENT_ACCESS_LEVEL => Ok(()),
            Ok(Some(r)) => {
                tracing::info!("[teller] Session access level is {:?}", r.payload.access_level);
                Err(ExchangeError::Unauthorized)
            }
            Ok(None) => Err(ExchangeError::Unauthorized),
            Err(e) if e.is(codes::INSUFFICIENT_PRIVILEGES) => Err(ExchangeError::Unauthorized),
            Err(e) => Err(e),
        }
    }

    /// Drop the cached session, if there is one.
    pub(crate) async fn invalidate_session(&self) -> Result<bool, ExchangeError> {
        if self.sessions.resolve(&self.credential.phone).await?.is_none() {
            return Ok(false);
        }
        self.sessions.invalidate(&self.credential.phone).await?;
        tracing::info!("[teller] Session invalidated");
        Ok(true)
    }
}

/// Ask the provider for a code, abandoning the wait on cancellation.
pub(crate) async fn request_code(
    provider: &dyn ConfirmationProvider,
    phone:    &str,
    ctx:      &CallContext,
) -> Result<String, ExchangeError> {
    ctx.run(provider.confirmation_code(phone)).await?
        .map_err(|e| ExchangeError::Confirmation(e.to_string()))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
