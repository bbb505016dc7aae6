//! Retry strategies for transient failures and provider rate limiting.
//!
//! A [`RetryStrategy`] pairs a [`Backoff`] generator with a maximum attempt
//! count. The attempt counter itself lives in the [`CallContext`], so it is
//! private to one logical call chain and never shared between unrelated calls.

use std::ops::ControlFlow;
use std::time::Duration;

use rand::Rng;

use crate::context::CallContext;
use crate::errors::ExchangeError;

/// Upper bound on a single exponential delay.
const MAX_DELAY: Duration = Duration::from_secs(30 * 60);

// ─── Backoff ──────────────────────────────────────────────────────────────────

/// Maps an attempt index to the time to wait before that attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Backoff {
    /// Always the same delay.
    Constant(Duration),
    /// `base × multiplier^attempt`, plus a random extra of up to
    /// `jitter × delay`.
    Exponential { base: Duration, multiplier: f64, jitter: f64 },
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Constant(d) => d,
            Self::Exponential { base, multiplier, jitter } => {
                let exp   = multiplier.powi(attempt.min(64) as i32);
                let delay = base.as_secs_f64() * exp;
                // negative or NaN factors mean no wait at all
                if delay.is_nan() || delay <= 0.0 {
                    return Duration::ZERO;
                }
                let delay = delay.min(MAX_DELAY.as_secs_f64());
                let extra = if jitter > 0.0 && jitter.is_finite() {
                    rand::thread_rng().gen_range(0.0..=jitter) * delay
                } else {
                    0.0
                };
                Duration::try_from_secs_f64(delay + extra).unwrap_or(Duration::MAX)
            }
        }
    }
}

// ─── RetryStrategy ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryStrategy {
    /// Key of this strategy's attempt counter inside the call context.
    pub name:        &'static str,
    pub backoff:     Backoff,
    /// Maximum number of retries; negative means unbounded.
    pub max_retries: i32,
}

impl RetryStrategy {
    /// HTTP status other than 200, or no response at all.
    pub const TRANSPORT: Self = Self {
        name:        "transport",
        backoff:     Backoff::Exponential { base: Duration::from_secs(1), multiplier: 2.0, jitter: 0.5 },
        max_retries: -1,
    };

    /// `REQUEST_RATE_LIMIT_EXCEEDED` from the provider.
    pub const PROVIDER_RATE_LIMIT: Self = Self {
        name:        "rate_limit",
        backoff:     Backoff::Exponential { base: Duration::from_secs(60), multiplier: 2.0, jitter: 0.2 },
        max_retries: 5,
    };

    /// One immediate retry after a fresh login.
    pub const REAUTHORIZE: Self = Self {
        name:        "reauthorize",
        backoff:     Backoff::Constant(Duration::ZERO),
        max_retries: 1,
    };

    /// Returns `true` if `ctx` has no retries of this strategy left.
    pub fn is_exhausted(&self, ctx: &CallContext) -> bool {
        self.max_retries >= 0 && ctx.attempts(self.name) >= self.max_retries as u32
    }

    /// Wait for the next attempt.
    ///
    /// `Continue(ctx')` carries the context for the next attempt;
    /// `Break(())` means the attempts are exhausted and the caller must surface
    /// the failure that led here. The wait itself fails only on cancellation.
    pub async fn wait(&self, ctx: &CallContext) -> Result<ControlFlow<(), CallContext>, ExchangeError> {
        if self.is_exhausted(ctx) {
            return Ok(ControlFlow::Break(()));
        }

        let attempt = ctx.attempts(self.name);
        let delay   = self.backoff.delay(attempt);
        if !delay.is_zero() {
            tracing::warn!("[teller] retry #{} ({}) in {:?}", attempt + 1, self.name, delay);
        }
        ctx.sleep(delay).await?;
        Ok(ControlFlow::Continue(ctx.with_attempt(self.name)))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
