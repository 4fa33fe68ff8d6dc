// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-call context carrying the caller's deadline, cancellation and metadata.

use crate::error::{PipelineError, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Context handed to every [`Endpoint`](super::Endpoint) call.
///
/// Cloning is cheap; clones observe the same cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
    metadata: Arc<BTreeMap<String, String>>,
}

/// Handle that cancels every context derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Cancel all calls running under the associated context.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether `cancel` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CallContext {
    /// A context with no deadline and no cancellation.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().deadline_in(timeout)
    }

    /// A cancellable context and the handle that cancels it.
    #[must_use]
    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            cancel: Some(rx),
            ..Self::default()
        };
        (ctx, CancelHandle { tx: Arc::new(tx) })
    }

    /// Tighten the deadline to `timeout` from now. Never extends an existing deadline.
    #[must_use]
    pub fn deadline_in(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Tighten the deadline to `deadline`. Never extends an existing deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Attach a metadata entry, forwarded to tracing and to the wire transport.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.metadata).insert(key.into(), value.into());
        self
    }

    /// The absolute deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `Some(Duration::ZERO)` once expired.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Caller-supplied metadata.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Whether the context was explicitly cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Whether the context was cancelled or its deadline has passed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        let cancelled = async {
            match &self.cancel {
                Some(rx) => {
                    let mut rx = rx.clone();
                    let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
                    if closed {
                        // Handle dropped without cancelling; only the deadline remains.
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            () = cancelled => {}
            () = expired => {}
        }
    }

    /// Run `fut` under this context.
    ///
    /// Fails fast with [`PipelineError::Cancelled`] when the context is already
    /// done, and drops `fut` as soon as the context fires mid-flight.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or the future's own error.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_done() {
            return Err(PipelineError::Cancelled);
        }
        tokio::select! {
            biased;
            () = self.done() => Err(PipelineError::Cancelled),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_never_done() {
        let ctx = CallContext::background();
        assert!(!ctx.is_done());
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test]
    async fn test_deadline_only_tightens() {
        let ctx = CallContext::with_timeout(Duration::from_millis(50))
            .deadline_in(Duration::from_secs(60));
        assert!(ctx.remaining().unwrap() <= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_cancel_handle() {
        let (ctx, handle) = CallContext::cancellable();
        assert!(!ctx.is_done());
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(ctx.is_cancelled());
        assert!(ctx.clone().is_done());
    }

    #[tokio::test]
    async fn test_run_fails_fast_when_done() {
        let (ctx, handle) = CallContext::cancellable();
        handle.cancel();
        let result = ctx.run(async { Ok::<_, PipelineError>(1) }).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_run_cancels_in_flight() {
        let ctx = CallContext::with_timeout(Duration::from_millis(20));
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, PipelineError>(())
            })
            .await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let (ctx, handle) = CallContext::cancellable();
        let waiter = tokio::spawn(async move {
            ctx.run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, PipelineError>(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[test]
    fn test_metadata() {
        let ctx = CallContext::background()
            .with_metadata("request-id", "abc")
            .with_metadata("tenant", "t1");
        assert_eq!(ctx.metadata().get("request-id").map(String::as_str), Some("abc"));
        assert_eq!(ctx.metadata().len(), 2);
    }
}
