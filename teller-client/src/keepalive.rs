//! Background session keep-alive.
//!
//! [`KeepAlive`] probes the session once right away and then on a fixed
//! interval. A probe that finds the session unusable drops it from the cache,
//! so the next real call signs in again instead of failing half-way. Any
//! other probe failure is logged and ignored: a network blip must not throw
//! away a session that is still valid.
//!
//! The loop never signs in by itself. It stops when the guard is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::CallContext;
use crate::Engine;

// ─── KeepAlive ────────────────────────────────────────────────────────────────

pub(crate) struct KeepAlive {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl KeepAlive {
    /// Start probing `engine` every `interval`.
    pub(crate) fn start(engine: Arc<Engine>, interval: Duration) -> Self {
        let stop  = CancellationToken::new();
        let stop2 = stop.clone();

        let task = tokio::spawn(async move {
            let ctx = CallContext::new(stop2.clone());
            loop {
                tick(&engine, &ctx).await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop2.cancelled()            => break,
                }
            }
            tracing::debug!("[teller/keepalive] Stopped");
        });

        Self { stop, task: Some(task) }
    }

    /// Stop the loop; an in-flight probe is abandoned.
    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop.cancel();
        // the token aborts every suspension point; abort covers a task that
        // has not been polled yet
        if let Some(t) = self.task.take() {
            t.abort();
        }
    }
}

/// One probe under the session lock, never retried.
pub(crate) async fn tick(engine: &Engine, ctx: &CallContext) {
    let (ctx, _guard) = match engine.lock.acquire(ctx).await {
        Ok(held) => held,
        Err(_)   => return,
    };

    match engine.probe_once(&ctx).await {
        Ok(()) => tracing::debug!("[teller/keepalive] Session is valid"),
        Err(e) if e.is_cancelled() => {}
        Err(e) if e.is_unauthorized() => match engine.invalidate_session().await {
            Ok(true)  => tracing::info!("[teller/keepalive] Session lost its privileges, dropped it"),
            Ok(false) => {}
            Err(e)    => tracing::warn!("[teller/keepalive] Failed to drop session: {e}"),
        },
        Err(e) => tracing::warn!("[teller/keepalive] Probe failed: {e}"),
    }
}
