// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policies, backoff strategies and the retry orchestrator.
//!
//! [`Retry`] sits in front of a load balancer: every attempt selects a fresh
//! endpoint, so a retried call lands on the next instance. Attempts stop on
//! success, on a non-retryable error, when the attempt budget is spent, or
//! when the retry deadline passes. A caller whose own context fires gets
//! `Cancelled` and no further attempts are made.
//!
//! # Example
//!
//! ```
//! use resilient_rpc::runtime::{RetryConfig, TransientCodes, FixedBackoff};
//! use std::time::Duration;
//!
//! let retry = RetryConfig::builder()
//!     .max_attempts(3)
//!     .deadline(Duration::from_millis(500))
//!     .policy(TransientCodes::new(vec![tonic::Code::Aborted]))
//!     .backoff(FixedBackoff::from_millis(10))
//!     .build();
//! assert_eq!(retry.max_attempts, 3);
//! ```

use crate::client::Balancer;
use crate::endpoint::{CallContext, Endpoint};
use crate::error::{PipelineError, Result};
use crate::runtime::metrics::MetricsCollector;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Defines a backoff strategy for retry delays.
pub trait BackoffStrategy: Clone + Send + Sync + 'static {
    /// Calculate the delay before the next retry attempt.
    ///
    /// # Arguments
    /// * `attempt` - The number of the attempt that just failed (0-indexed)
    fn delay(&self, attempt: u32) -> Duration;
}

/// No delay between retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffStrategy for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Fixed delay between retries.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    /// Create a new fixed backoff strategy.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Create a fixed backoff with delay in milliseconds.
    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl BackoffStrategy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Exponential backoff with optional random jitter of up to 25%.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff strategy.
    #[must_use]
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set the maximum delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the multiplier for exponential growth.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let delay = if self.jitter {
            capped + capped * 0.25 * rand::random::<f64>()
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }
}

/// Decides whether a failed attempt may be retried on another instance.
pub trait RetryPolicy: Clone + Send + Sync + 'static {
    /// Returns `true` if the call should be attempted again after `error`.
    fn should_retry(&self, error: &PipelineError) -> bool;
}

/// Retries transport failures only.
///
/// Rate limiting, open circuits, empty endpoint sets, cancellation and domain
/// errors all end the call immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, error: &PipelineError) -> bool {
        error.is_transport()
    }
}

/// Never retry - fail immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn should_retry(&self, _error: &PipelineError) -> bool {
        false
    }
}

/// Retries transport failures plus domain errors whose gRPC code is listed
/// as transient.
#[derive(Debug, Clone)]
pub struct TransientCodes {
    codes: Vec<tonic::Code>,
}

impl TransientCodes {
    /// Treat domain errors with one of `codes` as transient.
    #[must_use]
    pub fn new(codes: Vec<tonic::Code>) -> Self {
        Self { codes }
    }

    /// Codes that usually clear up on another instance.
    #[must_use]
    pub fn common() -> Self {
        Self::new(vec![
            tonic::Code::Aborted,
            tonic::Code::DeadlineExceeded,
            tonic::Code::ResourceExhausted,
        ])
    }
}

impl RetryPolicy for TransientCodes {
    fn should_retry(&self, error: &PipelineError) -> bool {
        match error {
            PipelineError::Transport(_) => true,
            PipelineError::Api(status) => self.codes.contains(&status.code()),
            _ => false,
        }
    }
}

/// Retry budget: attempt cap, deadline, policy and backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig<P: RetryPolicy = DefaultRetryPolicy, B: BackoffStrategy = NoBackoff> {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Time budget for all attempts of one call.
    pub deadline: Duration,
    /// Policy determining which errors to retry.
    pub policy: P,
    /// Backoff strategy for calculating delays.
    pub backoff: B,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            deadline: Duration::from_millis(500),
            policy: DefaultRetryPolicy,
            backoff: NoBackoff,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> RetryConfigBuilder<DefaultRetryPolicy, NoBackoff> {
        RetryConfigBuilder::new()
    }
}

/// Builder for `RetryConfig`.
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder<P: RetryPolicy, B: BackoffStrategy> {
    config: RetryConfig<P, B>,
}

impl RetryConfigBuilder<DefaultRetryPolicy, NoBackoff> {
    /// Create a new builder with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfigBuilder<DefaultRetryPolicy, NoBackoff> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: RetryPolicy, B: BackoffStrategy> RetryConfigBuilder<P, B> {
    /// Set the attempt cap.
    #[must_use]
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.config.max_attempts = max;
        self
    }

    /// Set the time budget for all attempts.
    #[must_use]
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.config.deadline = deadline;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn policy<P2: RetryPolicy>(self, policy: P2) -> RetryConfigBuilder<P2, B> {
        RetryConfigBuilder {
            config: RetryConfig {
                max_attempts: self.config.max_attempts,
                deadline: self.config.deadline,
                policy,
                backoff: self.config.backoff,
            },
        }
    }

    /// Set the backoff strategy.
    #[must_use]
    pub fn backoff<B2: BackoffStrategy>(self, backoff: B2) -> RetryConfigBuilder<P, B2> {
        RetryConfigBuilder {
            config: RetryConfig {
                max_attempts: self.config.max_attempts,
                deadline: self.config.deadline,
                policy: self.config.policy,
                backoff,
            },
        }
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> RetryConfig<P, B> {
        self.config
    }
}

/// Retry orchestrator wrapping a load balancer.
pub struct Retry<L, Req, Resp, P: RetryPolicy = DefaultRetryPolicy, B: BackoffStrategy = NoBackoff>
{
    operation: String,
    balancer: L,
    config: RetryConfig<P, B>,
    metrics: Option<Arc<MetricsCollector>>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<L, Req, Resp, P: RetryPolicy, B: BackoffStrategy> Retry<L, Req, Resp, P, B> {
    /// Retry calls to `operation` across endpoints chosen by `balancer`.
    pub fn new(operation: impl Into<String>, balancer: L, config: RetryConfig<P, B>) -> Self {
        Self {
            operation: operation.into(),
            balancer,
            config,
            metrics: None,
            _marker: PhantomData,
        }
    }

    /// Count retries in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The retry budget.
    pub fn config(&self) -> &RetryConfig<P, B> {
        &self.config
    }
}

#[async_trait]
impl<L, Req, Resp, P, B> Endpoint<Req, Resp> for Retry<L, Req, Resp, P, B>
where
    L: Balancer<Req, Resp>,
    Req: Clone + Send + Sync + 'static,
    Resp: Send + 'static,
    P: RetryPolicy,
    B: BackoffStrategy,
{
    async fn call(&self, ctx: &CallContext, request: Req) -> Result<Resp> {
        if ctx.is_done() {
            return Err(PipelineError::Cancelled);
        }
        let budget = ctx
            .clone()
            .with_deadline(Instant::now() + self.config.deadline);
        let mut attempts = 0u32;
        let mut last_error: Option<PipelineError> = None;

        while attempts < self.config.max_attempts && !budget.is_done() {
            let endpoint = match self.balancer.select() {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    return Err(match last_error {
                        Some(last) => PipelineError::RetriesExhausted {
                            attempts,
                            last: Box::new(last),
                        },
                        None => e,
                    });
                }
            };
            attempts += 1;

            let error = match budget.run(endpoint.call(&budget, request.clone())).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            // The caller's own deadline or cancellation wins over the budget.
            if ctx.is_done() {
                return Err(PipelineError::Cancelled);
            }
            if matches!(error, PipelineError::Cancelled) && budget.is_done() {
                last_error.get_or_insert(error);
                break;
            }
            if !self.config.policy.should_retry(&error) {
                return Err(error);
            }

            debug!(
                target: "resilient_rpc::retry",
                operation = %self.operation,
                attempt = attempts,
                error = %error,
                "attempt failed"
            );
            last_error = Some(error);

            if attempts < self.config.max_attempts {
                if let Some(metrics) = &self.metrics {
                    metrics.record_retry(&self.operation);
                }
                let delay = self.config.backoff.delay(attempts - 1);
                if !delay.is_zero() {
                    let slept = budget
                        .run(async {
                            tokio::time::sleep(delay).await;
                            Ok(())
                        })
                        .await;
                    if slept.is_err() {
                        if ctx.is_done() {
                            return Err(PipelineError::Cancelled);
                        }
                        break;
                    }
                }
            }
        }

        Err(PipelineError::RetriesExhausted {
            attempts,
            last: Box::new(last_error.unwrap_or(PipelineError::Cancelled)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{endpoint_fn, BoxEndpoint};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Balancer that always hands out the same endpoint.
    struct Single(BoxEndpoint<u32, u32>);

    impl Balancer<u32, u32> for Single {
        fn select(&self) -> Result<BoxEndpoint<u32, u32>> {
            Ok(self.0.clone())
        }
    }

    /// Balancer whose set empties after `left` selections.
    struct Draining {
        endpoint: BoxEndpoint<u32, u32>,
        left: AtomicU32,
    }

    impl Balancer<u32, u32> for Draining {
        fn select(&self) -> Result<BoxEndpoint<u32, u32>> {
            let available = self
                .left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if available {
                Ok(self.endpoint.clone())
            } else {
                Err(PipelineError::NoEndpointsAvailable {
                    service: "svc".to_string(),
                })
            }
        }
    }

    fn failing_then_ok(failures: u32, calls: Arc<AtomicU32>) -> Single {
        Single(Arc::new(endpoint_fn(move |_ctx, n: u32| {
            let calls = calls.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call < failures {
                    Err(PipelineError::Transport("connection reset".to_string()))
                } else {
                    Ok(n)
                }
            }
        })))
    }

    #[test]
    fn test_no_backoff() {
        assert_eq!(NoBackoff.delay(0), Duration::ZERO);
        assert_eq!(NoBackoff.delay(100), Duration::ZERO);
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = FixedBackoff::from_millis(100);
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(5), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(false);

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_exponential_backoff_cap_and_jitter() {
        let capped = ExponentialBackoff::new(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .with_jitter(false);
        assert_eq!(capped.delay(5), Duration::from_millis(500));

        let jittered = ExponentialBackoff::new(Duration::from_millis(100)).with_jitter(true);
        let delay = jittered.delay(0);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(125));
    }

    #[test]
    fn test_default_retry_policy() {
        let policy = DefaultRetryPolicy;
        assert!(policy.should_retry(&PipelineError::Transport("x".into())));
        assert!(!policy.should_retry(&PipelineError::RateLimited {
            operation: "op".into()
        }));
        assert!(!policy.should_retry(&PipelineError::CircuitOpen {
            operation: "op".into(),
            retry_after: None
        }));
        assert!(!policy.should_retry(&PipelineError::Cancelled));
        assert!(!policy.should_retry(&PipelineError::Api(tonic::Status::aborted("x"))));
    }

    #[test]
    fn test_transient_codes_policy() {
        let policy = TransientCodes::new(vec![tonic::Code::Aborted]);
        assert!(policy.should_retry(&PipelineError::Transport("x".into())));
        assert!(policy.should_retry(&PipelineError::Api(tonic::Status::aborted("x"))));
        assert!(!policy.should_retry(&PipelineError::Api(tonic::Status::not_found("x"))));
        assert!(!NoRetryPolicy.should_retry(&PipelineError::Transport("x".into())));
    }

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::builder()
            .max_attempts(5)
            .deadline(Duration::from_secs(2))
            .backoff(FixedBackoff::from_millis(200))
            .build();

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.deadline, Duration::from_secs(2));
        assert_eq!(config.backoff.delay(0), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = Retry::new("op", failing_then_ok(2, calls.clone()), RetryConfig::default());

        let result = retry.call(&CallContext::background(), 7).await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::builder()
            .max_attempts(3)
            .deadline(Duration::from_secs(5))
            .build();
        let retry = Retry::new("op", failing_then_ok(u32::MAX, calls.clone()), config);

        let started = std::time::Instant::now();
        let err = retry.call(&CallContext::background(), 7).await.unwrap_err();

        match err {
            PipelineError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.is_transport());
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_emptied_set_keeps_previous_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let balancer = Draining {
            endpoint: failing_then_ok(u32::MAX, calls.clone()).0,
            left: AtomicU32::new(1),
        };
        let retry = Retry::new("op", balancer, RetryConfig::default());

        let err = retry.call(&CallContext::background(), 7).await.unwrap_err();

        match err {
            PipelineError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 1);
                assert!(last.is_transport());
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_set_before_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let balancer = Draining {
            endpoint: failing_then_ok(0, calls.clone()).0,
            left: AtomicU32::new(0),
        };
        let retry = Retry::new("op", balancer, RetryConfig::default());

        let err = retry.call(&CallContext::background(), 7).await.unwrap_err();

        assert!(matches!(err, PipelineError::NoEndpointsAvailable { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let balancer = Single(Arc::new(endpoint_fn(move |_ctx, _n: u32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(PipelineError::RateLimited {
                    operation: "op".to_string(),
                })
            }
        })));
        let retry = Retry::new("op", balancer, RetryConfig::default());

        let err = retry.call(&CallContext::background(), 1).await.unwrap_err();

        assert!(matches!(err, PipelineError::RateLimited { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_caller_deadline_returns_cancelled() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let balancer = Single(Arc::new(endpoint_fn(move |_ctx, n: u32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(n)
            }
        })));
        let config = RetryConfig::builder()
            .max_attempts(5)
            .deadline(Duration::from_secs(10))
            .build();
        let retry = Retry::new("op", balancer, config);

        let ctx = CallContext::with_timeout(Duration::from_millis(30));
        let err = retry.call(&ctx, 1).await.unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_deadline_exhausts_with_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let balancer = Single(Arc::new(endpoint_fn(move |_ctx, n: u32| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(PipelineError::Transport("refused".to_string()));
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(n)
            }
        })));
        let config = RetryConfig::builder()
            .max_attempts(10)
            .deadline(Duration::from_millis(50))
            .build();
        let retry = Retry::new("op", balancer, config);

        let err = retry.call(&CallContext::background(), 1).await.unwrap_err();

        match err {
            PipelineError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(last.is_transport());
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_records_metrics() {
        let calls = Arc::new(AtomicU32::new(0));
        let metrics = Arc::new(MetricsCollector::with_defaults());
        let retry = Retry::new("op", failing_then_ok(2, calls), RetryConfig::default())
            .with_metrics(metrics.clone());

        retry.call(&CallContext::background(), 1).await.unwrap();

        assert_eq!(metrics.snapshot().retries, 2);
    }
}
