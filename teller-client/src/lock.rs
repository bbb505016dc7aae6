//! Context-scoped reentrant lock.
//!
//! Every authenticated call holds the client's [`SessionLock`] from session
//! resolution until its last retry completes. Re-authentication runs inside
//! that window and issues calls of its own, so acquisition is keyed on the
//! ownership recorded in the [`CallContext`]: a context derived from a held
//! acquisition passes straight through instead of waiting on itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::context::CallContext;
use crate::errors::ExchangeError;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

pub struct SessionLock {
    id:    u64,
    mutex: Arc<Mutex<()>>,
}

/// Held for as long as the owning call chain runs. Reentrant acquisitions
/// return an empty guard.
#[must_use]
pub struct SessionLockGuard {
    _guard: Option<OwnedMutexGuard<()>>,
}

impl SessionLock {
    pub fn new() -> Self {
        Self {
            id:    NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            mutex: Arc::new(Mutex::new(())),
        }
    }

    /// Acquire the lock for `ctx`, returning the derived context that records
    /// ownership. Waiting observes cancellation.
    pub async fn acquire(
        &self,
        ctx: &CallContext,
    ) -> Result<(CallContext, SessionLockGuard), ExchangeError> {
        ctx.check()?;
        if ctx.holds(self.id) {
            return Ok((ctx.clone(), SessionLockGuard { _guard: None }));
        }

        let guard = ctx.run(self.mutex.clone().lock_owned()).await?;
        Ok((ctx.with_lock(self.id), SessionLockGuard { _guard: Some(guard) }))
    }
}

impl Default for SessionLock {
    fn default() -> Self { Self::new() }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn reentrant_for_derived_context() {
        let lock = SessionLock::new();
        let (inner_ctx, _outer) = lock.acquire(&CallContext::default()).await.unwrap();

        let nested = tokio::time::timeout(Duration::from_secs(1), lock.acquire(&inner_ctx.fork())).await;
        assert!(nested.is_ok(), "derived context must not block on its own lock");
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_context_waits_until_release() {
        let lock = Arc::new(SessionLock::new());
        let (_, outer) = lock.acquire(&CallContext::default()).await.unwrap();

        let lock2 = lock.clone();
        let waiter = tokio::spawn(async move {
            lock2.acquire(&CallContext::default()).await.map(|_| ())
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        drop(outer);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn waiting_is_cancellable() {
        let lock = SessionLock::new();
        let (_, _outer) = lock.acquire(&CallContext::default()).await.unwrap();

        let token = CancellationToken::new();
        let ctx   = CallContext::new(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let err = lock.acquire(&ctx).await.err().unwrap();
        assert!(err.is_cancelled());
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn ownership_is_per_lock() {
        let a = SessionLock::new();
        let b = SessionLock::new();
        let (ctx, _guard) = a.acquire(&CallContext::default()).await.unwrap();
        assert!(ctx.holds(a.id));
        assert!(!ctx.holds(b.id));
    }
}
