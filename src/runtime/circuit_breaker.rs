// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit breaker pattern implementation for resilient endpoint calls.
//!
//! The circuit breaker prevents cascading failures by temporarily stopping
//! requests to a failing operation and allowing it to recover.
//!
//! # States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Requests immediately fail with `CircuitOpen`
//! - **Half-Open**: A single trial request decides whether to close again
//!
//! Every transition is reported to a [`BreakerObserver`].
//!
//! # Example
//!
//! ```
//! use resilient_rpc::runtime::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::default()
//!     .with_failure_threshold(5)
//!     .with_open_timeout(Duration::from_secs(30));
//!
//! let breaker = CircuitBreaker::new("GetProducts", config);
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! ```

use crate::endpoint::{CallContext, Endpoint};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally.
    Closed,
    /// Circuit is open, requests fail immediately.
    Open,
    /// Circuit is half-open, one trial request is in flight.
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding used by metrics (0=closed, 1=half-open, 2=open).
    #[must_use]
    pub fn as_gauge(self) -> u64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Receives every breaker state transition.
pub trait BreakerObserver: Send + Sync {
    /// Called after `operation`'s breaker moved from `from` to `to`.
    ///
    /// Runs under the breaker's lock, so transitions arrive in order. It
    /// must not call back into the same breaker.
    fn on_transition(&self, operation: &str, from: CircuitState, to: CircuitState);
}

/// Observer that logs transitions through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl BreakerObserver for LogObserver {
    fn on_transition(&self, operation: &str, from: CircuitState, to: CircuitState) {
        if to == CircuitState::Open {
            warn!(target: "resilient_rpc::circuit_breaker", %operation, %from, %to, "circuit opened");
        } else {
            info!(target: "resilient_rpc::circuit_breaker", %operation, %from, %to, "circuit state changed");
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed.
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(5),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the open timeout.
    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

#[derive(Debug)]
enum Mode {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

impl Mode {
    fn state(&self) -> CircuitState {
        match self {
            Mode::Closed { .. } => CircuitState::Closed,
            Mode::Open { .. } => CircuitState::Open,
            Mode::HalfOpen => CircuitState::HalfOpen,
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`Permit::success`] or [`Permit::failure`].
/// A permit dropped without an outcome (e.g. the call was cancelled) counts
/// as a failure so a half-open trial can never be lost.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    done: bool,
}

impl Permit<'_> {
    /// Whether this permit is the half-open trial.
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a successful call.
    pub fn success(self) {
        self.complete_at(true, Instant::now());
    }

    /// Record a failed call.
    pub fn failure(self) {
        self.complete_at(false, Instant::now());
    }

    fn complete_at(mut self, success: bool, now: Instant) {
        self.done = true;
        self.breaker.record(success, now);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.breaker.record(false, Instant::now());
        }
    }
}

/// Circuit breaker for protecting against cascading failures.
///
/// One breaker exists per logical operation and is shared by every endpoint
/// of that operation. Transitions are linearizable: all state lives behind a
/// single mutex that is never held across an `.await`.
pub struct CircuitBreaker {
    operation: String,
    config: CircuitBreakerConfig,
    mode: Mutex<Mode>,
    observer: Arc<dyn BreakerObserver>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("operation", &self.operation)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker that logs its transitions.
    #[must_use]
    pub fn new(operation: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_observer(operation, config, Arc::new(LogObserver))
    }

    /// Create a circuit breaker reporting transitions to `observer`.
    #[must_use]
    pub fn with_observer(
        operation: impl Into<String>,
        config: CircuitBreakerConfig,
        observer: Arc<dyn BreakerObserver>,
    ) -> Self {
        Self {
            operation: operation.into(),
            config,
            mode: Mutex::new(Mode::Closed {
                consecutive_failures: 0,
            }),
            observer,
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// The operation this breaker guards.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Get the current circuit state.
    ///
    /// An open circuit whose timeout has elapsed still reports `Open` until
    /// the next call is admitted as the trial.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Mode> {
        self.mode.lock().expect("circuit breaker lock poisoned")
    }

    /// Ask for admission.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::CircuitOpen` while the circuit is open or a
    /// half-open trial is already in flight.
    #[allow(clippy::result_large_err)]
    pub fn try_acquire(&self) -> Result<Permit<'_>> {
        self.try_acquire_at(Instant::now())
    }

    #[allow(clippy::result_large_err)]
    fn try_acquire_at(&self, now: Instant) -> Result<Permit<'_>> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let (admitted, trial, retry_after) = {
            let mut mode = self.lock();
            let decision = match &*mode {
                Mode::Closed { .. } => (true, false, None),
                Mode::Open { since } => {
                    let elapsed = now.saturating_duration_since(*since);
                    if elapsed >= self.config.open_timeout {
                        (true, true, None)
                    } else {
                        (false, false, Some(self.config.open_timeout - elapsed))
                    }
                }
                Mode::HalfOpen => (false, false, None),
            };
            if decision.1 {
                *mode = Mode::HalfOpen;
                self.notify(Some((CircuitState::Open, CircuitState::HalfOpen)));
            }
            decision
        };

        if admitted {
            Ok(Permit {
                breaker: self,
                trial,
                done: false,
            })
        } else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            Err(PipelineError::CircuitOpen {
                operation: self.operation.clone(),
                retry_after,
            })
        }
    }

    fn record(&self, success: bool, now: Instant) {
        if !success {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }
        let mut mode = self.lock();
        let from = mode.state();
        let next = match (&*mode, success) {
            (Mode::Closed { .. }, true) => Mode::Closed {
                consecutive_failures: 0,
            },
            (
                Mode::Closed {
                    consecutive_failures,
                },
                false,
            ) => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    Mode::Open { since: now }
                } else {
                    Mode::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            (Mode::HalfOpen, true) => Mode::Closed {
                consecutive_failures: 0,
            },
            (Mode::HalfOpen, false) => Mode::Open { since: now },
            // Outcome of a call admitted before a concurrent call opened the circuit.
            (Mode::Open { since }, _) => Mode::Open { since: *since },
        };
        *mode = next;
        let to = mode.state();
        self.notify((from != to).then_some((from, to)));
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        if let Some((from, to)) = transition {
            self.observer.on_transition(&self.operation, from, to);
        }
    }

    /// Execute an async operation with circuit breaker protection.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::CircuitOpen` if the circuit rejects the call,
    /// otherwise the operation's own error. Every error counts as a failure.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut mode = self.lock();
        let from = mode.state();
        *mode = Mode::Closed {
            consecutive_failures: 0,
        };
        self.notify((from != CircuitState::Closed).then_some((from, CircuitState::Closed)));
    }

    /// Time until the next trial call is admitted (if open).
    #[must_use]
    pub fn time_until_retry(&self) -> Option<Duration> {
        match *self.lock() {
            Mode::Open { since } => Some(
                self.config
                    .open_timeout
                    .saturating_sub(since.elapsed()),
            ),
            _ => None,
        }
    }

    /// Current consecutive failure count (zero unless closed).
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        match *self.lock() {
            Mode::Closed {
                consecutive_failures,
            } => consecutive_failures,
            _ => 0,
        }
    }

    /// Get total number of admission requests.
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Get total number of failures.
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Get total number of rejections (circuit open).
    #[must_use]
    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 to 1.0).
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.total_calls.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let failures = self.total_failures.load(Ordering::Relaxed);
        failures as f64 / total as f64
    }

    /// Get the circuit breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

/// Endpoint decorator guarded by a shared [`CircuitBreaker`].
pub struct CircuitBreakerEndpoint<E> {
    inner: E,
    breaker: Arc<CircuitBreaker>,
}

impl<E> CircuitBreakerEndpoint<E> {
    /// Wrap `inner` with `breaker`.
    pub fn new(inner: E, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait]
impl<E, Req, Resp> Endpoint<Req, Resp> for CircuitBreakerEndpoint<E>
where
    E: Endpoint<Req, Resp>,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: &CallContext, request: Req) -> Result<Resp> {
        let permit = self.breaker.try_acquire()?;
        match self.inner.call(ctx, request).await {
            Ok(response) => {
                permit.success();
                Ok(response)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }
}
