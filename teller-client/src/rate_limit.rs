//! Per-endpoint client-side rate limiting.
//!
//! A [`CompositeLimiter`] is a list of [`SlidingWindow`]s that must all admit
//! a call. A window counts the calls currently in flight plus the calls that
//! completed within the last `window`; a call is stamped when its
//! [`RateLimitPermit`] is dropped, whatever the outcome of the call was.
//!
//! [`RateLimits`] maps endpoint paths to limiters. Paths without an entry get
//! a permit immediately.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::context::CallContext;
use crate::errors::ExchangeError;

/// Path of the receipt endpoint, the only one the provider throttles hard.
pub const SHOPPING_RECEIPT_PATH: &str = "/common/v1/shopping_receipt";

// ─── SlidingWindow ────────────────────────────────────────────────────────────

/// At most `limit` calls per `window`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlidingWindow {
    limit:  usize,
    window: Duration,
}

impl SlidingWindow {
    /// # Panics
    /// If `limit` is zero: such a window would never admit a call.
    pub const fn new(limit: usize, window: Duration) -> Self {
        assert!(limit > 0, "a sliding window must admit at least one call");
        Self { limit, window }
    }

    pub const fn limit(&self) -> usize { self.limit }

    pub const fn window(&self) -> Duration { self.window }
}

struct WindowState {
    spec:      SlidingWindow,
    completed: VecDeque<Instant>,
}

impl WindowState {
    fn prune(&mut self, now: Instant) {
        while let Some(&at) = self.completed.front() {
            if at + self.spec.window <= now {
                self.completed.pop_front();
            } else {
                break;
            }
        }
    }

    /// `None` if the window admits one more call, otherwise when it might.
    fn check(&mut self, in_flight: usize, now: Instant) -> Result<(), Option<Instant>> {
        self.prune(now);
        if in_flight + self.completed.len() < self.spec.limit {
            Ok(())
        } else {
            // only a completed call can age out; in-flight ones wake us on drop
            Err(self.completed.front().map(|&at| at + self.spec.window))
        }
    }
}

// ─── CompositeLimiter ─────────────────────────────────────────────────────────

struct State {
    in_flight: usize,
    windows:   Vec<WindowState>,
}

pub struct CompositeLimiter {
    state:    parking_lot::Mutex<State>,
    released: Notify,
}

impl CompositeLimiter {
    pub fn new(windows: impl IntoIterator<Item = SlidingWindow>) -> Self {
        let windows = windows.into_iter()
            .map(|spec| WindowState { spec, completed: VecDeque::new() })
            .collect();
        Self {
            state:    parking_lot::Mutex::new(State { in_flight: 0, windows }),
            released: Notify::new(),
        }
    }

    /// Admit one call if every window allows it.
    ///
    /// On refusal returns the earliest instant at which a refusing window
    /// frees up by itself, if any.
    fn try_admit(&self, now: Instant) -> Result<(), Option<Instant>> {
        let mut state = self.state.lock();
        let in_flight = state.in_flight;
        let mut wake: Option<Instant> = None;
        let mut admitted = true;
        for w in state.windows.iter_mut() {
            if let Err(at) = w.check(in_flight, now) {
                admitted = false;
                // every refusing window has to clear, so wait for the latest
                wake = match (wake, at) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b)             => a.or(b),
                };
            }
        }
        if admitted {
            state.in_flight += 1;
            Ok(())
        } else {
            Err(wake)
        }
    }

    fn release(&self) {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            for w in state.windows.iter_mut() {
                w.completed.push_back(now);
            }
        }
        self.released.notify_waiters();
    }

    /// Wait until every window admits a call. Waiting observes cancellation.
    pub async fn acquire(self: &Arc<Self>, ctx: &CallContext) -> Result<RateLimitPermit, ExchangeError> {
        loop {
            ctx.check()?;

            let notified = self.released.notified();
            tokio::pin!(notified);
            // register before checking so a release in between is not lost
            notified.as_mut().enable();

            match self.try_admit(Instant::now()) {
                Ok(()) => return Ok(RateLimitPermit { limiter: Some(self.clone()) }),
                Err(Some(at)) => {
                    ctx.run(async {
                        tokio::select! {
                            _ = &mut notified                  => {}
                            _ = tokio::time::sleep_until(at)   => {}
                        }
                    }).await?;
                }
                Err(None) => ctx.run(&mut notified).await?,
            }
        }
    }
}

// ─── RateLimitPermit ──────────────────────────────────────────────────────────

/// Scoped admission for one call. Dropping it records the call as completed.
#[must_use]
pub struct RateLimitPermit {
    limiter: Option<Arc<CompositeLimiter>>,
}

impl RateLimitPermit {
    /// A permit for an endpoint without limits.
    pub fn unlimited() -> Self {
        Self { limiter: None }
    }
}

impl Drop for RateLimitPermit {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.release();
        }
    }
}

// ─── RateLimits ───────────────────────────────────────────────────────────────

/// Endpoint path → limiter registry.
///
/// Cloning shares the underlying windows.
#[derive(Clone, Default)]
pub struct RateLimits {
    limiters: HashMap<String, Arc<CompositeLimiter>>,
}

impl RateLimits {
    /// No endpoint is limited.
    pub fn none() -> Self {
        Self::default()
    }

    /// The provider's documented limits: receipts at most 25 per 75 s and
    /// 75 per 11 min.
    pub fn standard() -> Self {
        Self::none().with(SHOPPING_RECEIPT_PATH, [
            SlidingWindow::new(25, Duration::from_secs(75)),
            SlidingWindow::new(75, Duration::from_secs(11 * 60)),
        ])
    }

    /// Limit `path` by all of `windows`, replacing any earlier entry.
    pub fn with(mut self, path: impl Into<String>, windows: impl IntoIterator<Item = SlidingWindow>) -> Self {
        self.limiters.insert(path.into(), Arc::new(CompositeLimiter::new(windows)));
        self
    }

    pub fn is_limited(&self, path: &str) -> bool {
        self.limiters.contains_key(path)
    }

    /// Acquire a slot for `path`. Unlisted paths never wait.
    pub async fn acquire(&self, path: &str, ctx: &CallContext) -> Result<RateLimitPermit, ExchangeError> {
        match self.limiters.get(path) {
            None          => Ok(RateLimitPermit::unlimited()),
            Some(limiter) => {
                if let Err(wake) = limiter.try_admit(Instant::now()) {
                    tracing::debug!("[teller/ratelimit] {path}: waiting for a slot (until {wake:?})");
                } else {
                    return Ok(RateLimitPermit { limiter: Some(limiter.clone()) });
                }
                limiter.acquire(ctx).await
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    const SHORT: Duration = Duration::from_secs(10);
    const LONG:  Duration = Duration::from_secs(100);

    fn two_windows() -> RateLimits {
        RateLimits::none().with("/limited", [SlidingWindow::new(2, SHORT), SlidingWindow::new(3, LONG)])
    }

    #[test]
    #[should_panic(expected = "at least one call")]
    fn zero_limit_is_rejected() {
        let _ = SlidingWindow::new(0, SHORT);
    }

    #[test]
    fn standard_windows() {
        let w = SlidingWindow::new(25, Duration::from_secs(75));
        assert_eq!((w.limit(), w.window()), (25, Duration::from_secs(75)));
    }

    #[tokio::test(start_paused = true)]
    async fn unlisted_paths_never_block() {
        let limits = RateLimits::standard();
        let ctx = CallContext::default();
        let start = Instant::now();
        let mut permits = Vec::new();
        for _ in 0..1000 {
            permits.push(limits.acquire("/common/v1/operations", &ctx).await.unwrap());
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!limits.is_limited("/common/v1/operations"));
        assert!(limits.is_limited(SHOPPING_RECEIPT_PATH));
    }

    #[tokio::test(start_paused = true)]
    async fn admission_requires_every_window() {
        let limits = two_windows();
        let ctx = CallContext::default();
        let start = Instant::now();

        drop(limits.acquire("/limited", &ctx).await.unwrap());
        drop(limits.acquire("/limited", &ctx).await.unwrap());

        // the short window is full
        assert!(tokio::time::timeout(Duration::from_secs(1), limits.acquire("/limited", &ctx)).await.is_err());

        // admitted once both first calls age out of the short window
        drop(limits.acquire("/limited", &ctx).await.unwrap());
        assert_eq!(start.elapsed(), SHORT);

        // the short window has room again but the long one holds three calls
        drop(limits.acquire("/limited", &ctx).await.unwrap());
        assert_eq!(start.elapsed(), LONG);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_calls_count_until_released() {
        let limits = RateLimits::none().with("/one", [SlidingWindow::new(1, Duration::from_secs(1))]);
        let ctx = CallContext::default();

        let held = limits.acquire("/one", &ctx).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(3600), limits.acquire("/one", &ctx)).await.is_err());

        let released_at = Instant::now();
        drop(held);
        drop(limits.acquire("/one", &ctx).await.unwrap());
        // stamped at release, so the window runs from there
        assert_eq!(released_at.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_wakes_on_release() {
        let limits = RateLimits::none().with("/one", [SlidingWindow::new(1, Duration::from_secs(60))]);
        let ctx = CallContext::default();
        let held = limits.acquire("/one", &ctx).await.unwrap();

        let limits2 = limits.clone();
        let waiter = tokio::spawn(async move {
            limits2.acquire("/one", &CallContext::default()).await.map(drop)
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn waiting_is_cancellable() {
        let limits = RateLimits::none().with("/one", [SlidingWindow::new(1, Duration::from_secs(3600))]);
        let _held = limits.acquire("/one", &CallContext::default()).await.unwrap();

        let token = CancellationToken::new();
        let ctx   = CallContext::new(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let err = limits.acquire("/one", &ctx).await.err().unwrap();
        assert!(err.is_cancelled());
        canceller.await.unwrap();
    }
}
