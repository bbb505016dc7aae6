//! HTTP boundary of the exchange engines.
//!
//! Engines build an [`HttpRequest`] and hand it to an [`HttpTransport`]. The
//! default implementation is [`ReqwestTransport`]; tests substitute a scripted
//! transport.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::ExchangeError;

// ─── Request / Response ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get  => "GET",
            Self::Post => "POST",
        })
    }
}

/// One outbound request.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method:  Method,
    /// Absolute URL without the query string.
    pub url:     String,
    /// Path relative to the base URL, for logs and rate limiting.
    pub path:    String,
    pub query:   Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// `application/x-www-form-urlencoded` body, already encoded.
    pub form:    Option<String>,
}

impl HttpRequest {
    /// Value of the query parameter `name`, if present.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Value of the header `name` (case-insensitive), if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decoded form body as key/value pairs.
    pub fn form_pairs(&self) -> Vec<(String, String)> {
        self.form.as_deref()
            .and_then(|f| serde_urlencoded::from_str(f).ok())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body:   String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, body: body.into() }
    }
}

// ─── Trait ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform `request`. Any received status, including errors, is an `Ok`;
    /// only a missing response is an [`ExchangeError::Transport`].
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ExchangeError>;
}

// ─── ReqwestTransport ─────────────────────────────────────────────────────────

/// [`HttpTransport`] over a shared `reqwest::Client` (rustls).
#[derive(Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, ExchangeError> {
        Self::with_timeout(Duration::from_secs(60))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("teller-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExchangeError::Config(format!("http client: {e}")))?;
        Ok(Self { http })
    }

    /// Wrap an already configured client.
    pub fn from_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ExchangeError> {
        let mut builder = match request.method {
            Method::Get  => self.http.get(&request.url),
            Method::Post => self.http.post(&request.url),
        };
        builder = builder.query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(form) = request.form {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(form);
        }

        let response = builder.send().await
            .map_err(|e| ExchangeError::Transport(format!("{} {}: {e}", request.method, request.path)))?;
        let status = response.status().as_u16();
        let body = response.text().await
            .map_err(|e| ExchangeError::Transport(format!("{} {}: read body: {e}", request.method, request.path)))?;
        Ok(HttpResponse { status, body })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
