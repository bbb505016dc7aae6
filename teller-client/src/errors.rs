//! Error types for teller-client.
//!
//! Every public operation returns [`ExchangeError`]. "No data found" is not an
//! error: the engines report it as `Ok(None)` and the typed operations turn it
//! into an empty collection.

use std::{fmt, io};

// ─── ResultCodeError ──────────────────────────────────────────────────────────

/// The primary protocol answered with a result code other than the one the
/// call descriptor expects.
///
/// # Example
/// `{"resultCode": "INSUFFICIENT_PRIVILEGES", "errorMessage": "..."}` for a call
/// expecting `OK` becomes
/// `ResultCodeError { expected: "OK", actual: "INSUFFICIENT_PRIVILEGES", .. }`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultCodeError {
    pub expected: String,
    pub actual:   String,
    /// Provider message, verbatim. Empty when the provider sent none.
    pub message:  String,
}

impl fmt::Display for ResultCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} != {}", self.actual, self.expected)?;
        if !self.message.is_empty() {
            write!(f, " ({})", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ResultCodeError {}

impl ResultCodeError {
    /// Match on the actual result code, with optional wildcard prefix/suffix `'*'`.
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.actual.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.actual.ends_with(suffix)
        } else {
            self.actual == pattern
        }
    }
}

// ─── InvestError ──────────────────────────────────────────────────────────────

/// Error body of the secondary (invest) protocol: `{errorMessage, errorCode}`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct InvestError {
    #[serde(rename = "errorMessage", default)]
    pub message: String,
    #[serde(rename = "errorCode", default)]
    pub code:    String,
}

impl fmt::Display for InvestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for InvestError {}

impl InvestError {
    /// The provider reports missing resources, and expired sessions, this way.
    pub fn is_not_found(&self) -> bool {
        self.code == "404"
    }
}

// ─── BrowserError ─────────────────────────────────────────────────────────────

/// A remote browser driver operation failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrowserError {
    /// What the driver was doing, e.g. `find //input[@automation-id='otp-input']`.
    pub action:  String,
    pub message: String,
}

impl BrowserError {
    pub fn new(action: impl Into<String>, message: impl fmt::Display) -> Self {
        Self { action: action.into(), message: message.to_string() }
    }
}

impl fmt::Display for BrowserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.action, self.message)
    }
}

impl std::error::Error for BrowserError {}

// ─── ExchangeError ────────────────────────────────────────────────────────────

/// The error type returned from any [`crate::Client`] method.
#[derive(Debug)]
pub enum ExchangeError {
    /// Connection, DNS or I/O failure before any HTTP status was received.
    Transport(String),
    /// Non-success HTTP status whose body could not be decoded.
    Http { status: u16, body: String },
    /// Primary protocol: unexpected result code.
    ResultCode(ResultCodeError),
    /// Secondary protocol: decoded error body.
    Invest(InvestError),
    /// No usable session: none cached for a CHECK call, or the probe reported
    /// a degraded privilege level.
    Unauthorized,
    /// The caller's cancellation token fired.
    Cancelled,
    /// Response body could not be decoded.
    Decode { path: String, message: String },
    /// Request parameters could not be encoded.
    Encode { path: String, message: String },
    /// The call succeeded but carried no payload where one is required.
    MissingPayload(String),
    /// A step of an auth flow failed.
    Auth { step: &'static str, source: Box<ExchangeError> },
    /// The confirmation-code provider failed.
    Confirmation(String),
    /// The remote browser driver failed.
    Browser(BrowserError),
    /// The session storage failed.
    Storage(io::Error),
    /// Invalid client configuration.
    Config(String),
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e)              => write!(f, "transport error: {e}"),
            Self::Http { status, body }     => {
                if body.is_empty() {
                    write!(f, "HTTP {status}")
                } else {
                    write!(f, "HTTP {status}: {body}")
                }
            }
            Self::ResultCode(e)             => write!(f, "{e}"),
            Self::Invest(e)                 => write!(f, "{e}"),
            Self::Unauthorized              => write!(f, "no sessionid"),
            Self::Cancelled                 => write!(f, "cancelled"),
            Self::Decode { path, message }  => write!(f, "decode {path}: {message}"),
            Self::Encode { path, message }  => write!(f, "encode {path}: {message}"),
            Self::MissingPayload(path)      => write!(f, "{path}: empty payload"),
            Self::Auth { step, source }     => write!(f, "{step}: {source}"),
            Self::Confirmation(e)           => write!(f, "get confirmation code: {e}"),
            Self::Browser(e)                => write!(f, "browser: {e}"),
            Self::Storage(e)                => write!(f, "session storage: {e}"),
            Self::Config(e)                 => write!(f, "invalid config: {e}"),
        }
    }
}

impl std::error::Error for ExchangeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ResultCode(e)         => Some(e),
            Self::Invest(e)             => Some(e),
            Self::Browser(e)            => Some(e),
            Self::Storage(e)            => Some(e),
            Self::Auth { source, .. }   => Some(source.as_ref()),
            _                           => None,
        }
    }
}

impl From<io::Error> for ExchangeError {
    fn from(e: io::Error) -> Self { Self::Storage(e) }
}

impl From<BrowserError> for ExchangeError {
    fn from(e: BrowserError) -> Self { Self::Browser(e) }
}

impl From<ResultCodeError> for ExchangeError {
    fn from(e: ResultCodeError) -> Self { Self::ResultCode(e) }
}

impl From<InvestError> for ExchangeError {
    fn from(e: InvestError) -> Self { Self::Invest(e) }
}

impl ExchangeError {
    /// Wrap `self` as the failure of the named auth-flow step.
    pub(crate) fn in_step(self, step: &'static str) -> Self {
        match self {
            // cancellation must stay recognisable through every layer
            Self::Cancelled => Self::Cancelled,
            other           => Self::Auth { step, source: Box::new(other) },
        }
    }

    /// Returns `true` if the call was cancelled, at any wrapping depth.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled             => true,
            Self::Auth { source, .. }   => source.is_cancelled(),
            _                           => false,
        }
    }

    /// Returns `true` if no usable session was available.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Unauthorized          => true,
            Self::Auth { source, .. }   => source.is_unauthorized(),
            _                           => false,
        }
    }

    /// Returns `true` if this is the named result code (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::ResultCode(e) => e.is(pattern),
            _                   => false,
        }
    }

    /// The primary protocol result code carried by this error, if any.
    pub fn result_code(&self) -> Option<&str> {
        match self {
            Self::ResultCode(e)         => Some(&e.actual),
            Self::Auth { source, .. }   => source.result_code(),
            _                           => None,
        }
    }

    /// Returns `true` for conditions the primary engine retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Http { .. } => true,
            Self::ResultCode(e) => e.is(codes::REQUEST_RATE_LIMIT_EXCEEDED)
                                || e.is(codes::INSUFFICIENT_PRIVILEGES),
            _ => false,
        }
    }
}

// ─── Result codes ─────────────────────────────────────────────────────────────

/// Primary protocol result codes the engine reacts to.
pub mod codes {
    pub const OK:                          &str = "OK";
    pub const WAITING_CONFIRMATION:        &str = "WAITING_CONFIRMATION";
    pub const NO_DATA_FOUND:               &str = "NO_DATA_FOUND";
    pub const REQUEST_RATE_LIMIT_EXCEEDED: &str = "REQUEST_RATE_LIMIT_EXCEEDED";
    pub const INSUFFICIENT_PRIVILEGES:     &str = "INSUFFICIENT_PRIVILEGES";
}

// ─── Tests ────────────────────────────────────────────────────────────────────
