//! Per-call context threaded through every suspension point.
//!
//! A [`CallContext`] carries the caller's cancellation token, the set of
//! [`SessionLock`](crate::lock::SessionLock)s the logical call chain already
//! holds, an optional session that overrides the cache (used while an auth
//! flow is still building a session), and the attempt counters of the retry
//! strategies used so far in this chain.
//!
//! Contexts are immutable; every change produces a derived copy.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::errors::ExchangeError;
use crate::session::Session;

#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancel:   CancellationToken,
    held:     Vec<u64>,
    session:  Option<Session>,
    attempts: HashMap<&'static str, u32>,
}

impl CallContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, ..Default::default() }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with [`ExchangeError::Cancelled`] if the token already fired.
    pub fn check(&self) -> Result<(), ExchangeError> {
        if self.cancel.is_cancelled() {
            Err(ExchangeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` to completion unless the token fires first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ExchangeError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ExchangeError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `delay` unless the token fires first.
    pub async fn sleep(&self, delay: std::time::Duration) -> Result<(), ExchangeError> {
        self.check()?;
        if delay.is_zero() {
            return Ok(());
        }
        self.run(tokio::time::sleep(delay)).await
    }

    // ── Lock ownership ─────────────────────────────────────────────────────

    pub(crate) fn holds(&self, lock_id: u64) -> bool {
        self.held.contains(&lock_id)
    }

    pub(crate) fn with_lock(&self, lock_id: u64) -> Self {
        let mut next = self.clone();
        if !next.held.contains(&lock_id) {
            next.held.push(lock_id);
        }
        next
    }

    // ── Pending session ────────────────────────────────────────────────────

    pub(crate) fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub(crate) fn with_session(&self, session: Session) -> Self {
        Self { session: Some(session), ..self.clone() }
    }

    // ── Retry counters ─────────────────────────────────────────────────────

    pub(crate) fn attempts(&self, strategy: &'static str) -> u32 {
        self.attempts.get(strategy).copied().unwrap_or(0)
    }

    pub(crate) fn with_attempt(&self, strategy: &'static str) -> Self {
        let mut next = self.clone();
        *next.attempts.entry(strategy).or_insert(0) += 1;
        next
    }

    /// A context for an unrelated sub-call: same cancellation, locks and
    /// pending session, fresh retry counters.
    pub(crate) fn fork(&self) -> Self {
        Self {
            cancel:   self.cancel.clone(),
            held:     self.held.clone(),
            session:  self.session.clone(),
            attempts: HashMap::new(),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
