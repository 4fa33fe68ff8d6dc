// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runtime utilities for resilience and observability.
//!
//! Each resilience concern is an endpoint decorator: rate limiting, circuit
//! breaking and tracing wrap a single instance's endpoint, while [`Retry`]
//! wraps the load balancer. Logging and metrics observe the whole invocation.

mod circuit_breaker;
mod logging;
pub mod metrics;
mod rate_limit;
mod retry;
pub mod tracing;

pub use circuit_breaker::{
    BreakerObserver, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEndpoint, CircuitState,
    LogObserver, Permit,
};
pub use logging::{CallCounters, LogLevel, LoggingConfig, RequestLogger, RequestSpan};
pub use metrics::{MetricsCollector, MetricsConfig, MetricsConfigBuilder, MetricsSnapshot};
pub use rate_limit::{RateLimitedEndpoint, RateLimiter, RateLimiterConfig, TokenBucket};
pub use retry::{
    BackoffStrategy, DefaultRetryPolicy, ExponentialBackoff, FixedBackoff, NoBackoff,
    NoRetryPolicy, Retry, RetryConfig, RetryConfigBuilder, RetryPolicy, TransientCodes,
};
pub use self::tracing::{CallSpan, TracingConfig, TracingConfigBuilder, TracingEndpoint};
