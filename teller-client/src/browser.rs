//! Browser-driven login.
//!
//! When the provider blocks the programmatic login, the session is obtained by
//! walking the web login page. The page shows its steps in no fixed order (an
//! access-code prompt may or may not appear, the password may be asked before
//! or after the one-time code), so the flow is a small state machine:
//!
//! * every [`BrowserStep`] starts out pending;
//! * each poll round looks at **all** pending steps and acts on the first one
//!   whose element is visible, then drops it from the pending set;
//! * [`BrowserStep::LoginComplete`] ends the flow by reading the session
//!   cookie.
//!
//! The remote browser is reached through [`BrowserDriver`]; the `chrome`
//! feature provides one backed by a local Chrome via `headless_chrome`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::auth::{ConfirmationProvider, Credential, request_code};
use crate::context::CallContext;
use crate::errors::{BrowserError, ExchangeError};
use crate::session::Session;

pub const DEFAULT_LOGIN_URL:      &str = "https://www.tinkoff.ru/auth/login";
pub const DEFAULT_SESSION_COOKIE: &str = "api_session";

// ─── BrowserStep ──────────────────────────────────────────────────────────────

/// The login page states the flow knows how to handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BrowserStep {
    PhoneInput,
    PasswordInput,
    OtpInput,
    DismissAccessCode,
    LoginComplete,
}

impl BrowserStep {
    pub const ALL: [Self; 5] = [
        Self::PhoneInput,
        Self::PasswordInput,
        Self::OtpInput,
        Self::DismissAccessCode,
        Self::LoginComplete,
    ];

    /// XPath of the element whose visibility announces this step.
    pub fn locator(self) -> &'static str {
        match self {
            Self::PhoneInput        => "//input[@automation-id='phone-input']",
            Self::PasswordInput     => "//input[@automation-id='password-input']",
            Self::OtpInput          => "//input[@automation-id='otp-input']",
            Self::DismissAccessCode => "//button[@automation-id='cancel-button']",
            Self::LoginComplete     => "//div[@automation-id='conversations-list']",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::PhoneInput        => "enter phone",
            Self::PasswordInput     => "enter password",
            Self::OtpInput          => "enter confirmation code",
            Self::DismissAccessCode => "dismiss access code prompt",
            Self::LoginComplete     => "read session cookie",
        }
    }
}

impl fmt::Display for BrowserStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Driver traits ────────────────────────────────────────────────────────────

/// Handle to the `index`-th element matched by `locator` at discovery time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Element {
    pub locator: String,
    pub index:   usize,
}

/// One remote browser session.
#[async_trait]
pub trait BrowserDriver: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;

    /// All elements currently matching the XPath `locator`; empty if none.
    async fn find_elements(&mut self, locator: &str) -> Result<Vec<Element>, BrowserError>;

    async fn is_displayed(&mut self, element: &Element) -> Result<bool, BrowserError>;

    /// Type `text` into `element`, pressing Enter afterwards if `submit`.
    async fn send_keys(&mut self, element: &Element, text: &str, submit: bool) -> Result<(), BrowserError>;

    async fn click(&mut self, element: &Element) -> Result<(), BrowserError>;

    /// Value of the cookie `name`, if set.
    async fn cookie(&mut self, name: &str) -> Result<Option<String>, BrowserError>;

    async fn close(&mut self) -> Result<(), BrowserError>;
}

/// Opens fresh [`BrowserDriver`] sessions.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserDriver>, BrowserError>;
}

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct BrowserAuthConfig {
    pub launcher:       Arc<dyn BrowserLauncher>,
    pub login_url:      String,
    pub session_cookie: String,
    /// Pause between two detection rounds.
    pub poll_interval:  Duration,
    /// How long one step may take to show up.
    pub step_timeout:   Duration,
}

impl BrowserAuthConfig {
    pub fn new(launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            launcher,
            login_url:      DEFAULT_LOGIN_URL.to_string(),
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            poll_interval:  Duration::from_millis(500),
            step_timeout:   Duration::from_secs(60),
        }
    }

    pub fn login_url(mut self, url: impl Into<String>) -> Self {
        self.login_url = url.into();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }
}

// ─── Flow ─────────────────────────────────────────────────────────────────────

/// Log in through the browser and return the session from the cookie.
///
/// The driver session is closed whatever the outcome.
pub(crate) async fn authorize(
    config:       &BrowserAuthConfig,
    credential:   &Credential,
    confirmation: &dyn ConfirmationProvider,
    ctx:          &CallContext,
) -> Result<Session, ExchangeError> {
    let mut driver = ctx.run(config.launcher.launch()).await?
        .map_err(|e| ExchangeError::from(e).in_step("launch browser"))?;

    let outcome = drive(driver.as_mut(), config, credential, confirmation, ctx).await;

    if let Err(e) = driver.close().await {
        tracing::warn!("[teller/browser] Failed to close browser: {e}");
    }
    outcome
}

async fn drive(
    driver:       &mut dyn BrowserDriver,
    config:       &BrowserAuthConfig,
    credential:   &Credential,
    confirmation: &dyn ConfirmationProvider,
    ctx:          &CallContext,
) -> Result<Session, ExchangeError> {
    ctx.run(driver.navigate(&config.login_url)).await?
        .map_err(|e| ExchangeError::from(e).in_step("open login page"))?;

    let mut pending: BTreeSet<BrowserStep> = BrowserStep::ALL.into_iter().collect();
    loop {
        let (step, element) = detect(driver, &pending, config, ctx).await?;
        pending.remove(&step);
        tracing::debug!("[teller/browser] {step}");

        let wrap = |e: BrowserError| ExchangeError::from(e).in_step(step.name());
        match step {
            BrowserStep::PhoneInput => {
                ctx.run(driver.send_keys(&element, &credential.phone, true)).await?.map_err(wrap)?;
            }
            BrowserStep::PasswordInput => {
                ctx.run(driver.send_keys(&element, &credential.password, true)).await?.map_err(wrap)?;
            }
            BrowserStep::OtpInput => {
                let code = request_code(confirmation, &credential.phone, ctx).await
                    .map_err(|e| e.in_step(step.name()))?;
                ctx.run(driver.send_keys(&element, &code, false)).await?.map_err(wrap)?;
            }
            BrowserStep::DismissAccessCode => {
                ctx.run(driver.click(&element)).await?.map_err(wrap)?;
            }
            BrowserStep::LoginComplete => {
                let cookie = ctx.run(driver.cookie(&config.session_cookie)).await?.map_err(wrap)?;
                return match cookie {
                    Some(id) if !id.is_empty() => {
                        tracing::info!("[teller/browser] Login complete");
                        Ok(Session::new(id))
                    }
                    _ => Err(wrap(BrowserError::new(
                        format!("cookie {}", config.session_cookie),
                        "not set after login",
                    ))),
                };
            }
        }
    }
}

/// Poll until one of the `pending` steps has a visible element.
async fn detect(
    driver:  &mut dyn BrowserDriver,
    pending: &BTreeSet<BrowserStep>,
    config:  &BrowserAuthConfig,
    ctx:     &CallContext,
) -> Result<(BrowserStep, Element), ExchangeError> {
    let deadline = Instant::now() + config.step_timeout;
    loop {
        ctx.check()?;
        for &step in pending {
            let elements = ctx.run(driver.find_elements(step.locator())).await?
                .map_err(|e| ExchangeError::from(e).in_step("detect login step"))?;
            for element in elements {
                let visible = ctx.run(driver.is_displayed(&element)).await?
                    .map_err(|e| ExchangeError::from(e).in_step("detect login step"))?;
                if visible {
                    return Ok((step, element));
                }
            }
        }

        if Instant::now() >= deadline {
            let waiting: Vec<_> = pending.iter().map(|s| s.name()).collect();
            return Err(ExchangeError::from(BrowserError::new(
                "wait for login page",
                format!("none of [{}] became visible within {:?}", waiting.join(", "), config.step_timeout),
            )).in_step("detect login step"));
        }
        ctx.sleep(config.poll_interval).await?;
    }
}

// ─── Chrome ───────────────────────────────────────────────────────────────────

#[cfg(feature = "chrome")]
pub use chrome::ChromeLauncher;

#[cfg(feature = "chrome")]
mod chrome {
    use super::*;
    use headless_chrome::{Browser, LaunchOptions, Tab};

    /// Launches a local Chrome/Chromium over the DevTools protocol.
    ///
    /// `headless_chrome` is blocking, so every driver call runs on the
    /// blocking pool.
    #[derive(Clone, Debug)]
    pub struct ChromeLauncher {
        pub headless: bool,
        pub sandbox:  bool,
    }

    impl Default for ChromeLauncher {
        fn default() -> Self {
            Self { headless: true, sandbox: true }
        }
    }

    #[async_trait]
    impl BrowserLauncher for ChromeLauncher {
        async fn launch(&self) -> Result<Box<dyn BrowserDriver>, BrowserError> {
            let (headless, sandbox) = (self.headless, self.sandbox);
            let (browser, tab) = tokio::task::spawn_blocking(move || {
                let options = LaunchOptions::default_builder()
                    .headless(headless)
                    .sandbox(sandbox)
                    .build()
                    .map_err(|e| BrowserError::new("launch chrome", e))?;
                let browser = Browser::new(options).map_err(|e| BrowserError::new("launch chrome", e))?;
                let tab = browser.new_tab().map_err(|e| BrowserError::new("open tab", e))?;
                Ok::<_, BrowserError>((browser, tab))
            })
            .await
            .map_err(|e| BrowserError::new("launch chrome", e))??;

            tracing::info!("[teller/browser] Chrome launched");
            Ok(Box::new(ChromeDriver { browser: Some(browser), tab }))
        }
    }

    struct ChromeDriver {
        browser: Option<Browser>,
        tab:     Arc<Tab>,
    }

    /// JS resolving the `index`-th node matched by `xpath`.
    fn node_js(xpath: &str, index: usize) -> String {
        let xpath = serde_json::Value::String(xpath.to_string());
        format!(
            "document.evaluate({xpath}, document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null).snapshotItem({index})"
        )
    }

    impl ChromeDriver {
        async fn eval(&self, action: String, script: String) -> Result<serde_json::Value, BrowserError> {
            let tab = self.tab.clone();
            tokio::task::spawn_blocking(move || {
                tab.evaluate(&script, false)
                    .map(|r| r.value.unwrap_or(serde_json::Value::Null))
                    .map_err(|e| BrowserError::new(action.clone(), e))
            })
            .await
            .map_err(|e| BrowserError::new("evaluate", e))?
        }

        async fn blocking<T, F>(&self, action: String, f: F) -> Result<T, BrowserError>
        where
            T: Send + 'static,
            F: FnOnce(&Tab) -> Result<T, String> + Send + 'static,
        {
            let tab = self.tab.clone();
            tokio::task::spawn_blocking(move || f(&tab).map_err(|e| BrowserError::new(action.clone(), e)))
                .await
                .map_err(|e| BrowserError::new("driver task", e))?
        }
    }

    #[async_trait]
    impl BrowserDriver for ChromeDriver {
        async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
            let url = url.to_string();
            self.blocking(format!("navigate {url}"), move |tab| {
                tab.navigate_to(&url).map_err(|e| e.to_string())?;
                tab.wait_until_navigated().map_err(|e| e.to_string())?;
                Ok(())
            }).await
        }

        async fn find_elements(&mut self, locator: &str) -> Result<Vec<Element>, BrowserError> {
            let xpath = serde_json::Value::String(locator.to_string());
            let script = format!(
                "document.evaluate({xpath}, document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null).snapshotLength"
            );
            let count = self.eval(format!("find {locator}"), script).await?
                .as_u64()
                .unwrap_or(0) as usize;
            Ok((0..count).map(|index| Element { locator: locator.to_string(), index }).collect())
        }

        async fn is_displayed(&mut self, element: &Element) -> Result<bool, BrowserError> {
            let script = format!(
                "(() => {{ const n = {}; if (!n) return false; \
                 const s = getComputedStyle(n); \
                 return s.visibility !== 'hidden' && s.display !== 'none' \
                     && !!(n.offsetWidth || n.offsetHeight || n.getClientRects().length); }})()",
                node_js(&element.locator, element.index),
            );
            Ok(self.eval(format!("is displayed {}", element.locator), script).await?
                .as_bool()
                .unwrap_or(false))
        }

        async fn send_keys(&mut self, element: &Element, text: &str, submit: bool) -> Result<(), BrowserError> {
            let focus = format!(
                "(() => {{ const n = {}; if (!n) return false; n.focus(); return true; }})()",
                node_js(&element.locator, element.index),
            );
            let focused = self.eval(format!("focus {}", element.locator), focus).await?;
            if focused.as_bool() != Some(true) {
                return Err(BrowserError::new(format!("focus {}", element.locator), "element is gone"));
            }

            let text = text.to_string();
            self.blocking(format!("type into {}", element.locator), move |tab| {
                tab.type_str(&text).map_err(|e| e.to_string())?;
                if submit {
                    tab.press_key("Enter").map_err(|e| e.to_string())?;
                }
                Ok(())
            }).await
        }

        async fn click(&mut self, element: &Element) -> Result<(), BrowserError> {
            let script = format!(
                "(() => {{ const n = {}; if (!n) return false; n.click(); return true; }})()",
                node_js(&element.locator, element.index),
            );
            match self.eval(format!("click {}", element.locator), script).await?.as_bool() {
                Some(true) => Ok(()),
                _          => Err(BrowserError::new(format!("click {}", element.locator), "element is gone")),
            }
        }

        async fn cookie(&mut self, name: &str) -> Result<Option<String>, BrowserError> {
            let name = name.to_string();
            self.blocking(format!("cookie {name}"), move |tab| {
                let cookies = tab.get_cookies().map_err(|e| e.to_string())?;
                Ok(cookies.into_iter().find(|c| c.name == name).map(|c| c.value))
            }).await
        }

        async fn close(&mut self) -> Result<(), BrowserError> {
            if let Some(browser) = self.browser.take() {
                // dropping the browser kills the process
                tokio::task::spawn_blocking(move || drop(browser))
                    .await
                    .map_err(|e| BrowserError::new("close chrome", e))?;
            }
            Ok(())
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
