// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token-bucket rate limiting for endpoint calls.
//!
//! The limiter never waits for a token: when the bucket is empty the call
//! fails immediately with [`PipelineError::RateLimited`].
//!
//! # Example
//!
//! ```
//! use resilient_rpc::runtime::{RateLimiter, RateLimiterConfig};
//!
//! let limiter = RateLimiter::new(
//!     "GetProducts",
//!     RateLimiterConfig::new().with_capacity(2).with_refill_rate(1.0),
//! );
//!
//! assert!(limiter.try_acquire());
//! assert!(limiter.try_acquire());
//! assert!(!limiter.try_acquire());
//! ```

use crate::endpoint::{CallContext, Endpoint};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::debug;

/// Configuration for the token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Maximum number of tokens (burst size).
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_rate: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_rate: 100.0,
        }
    }
}

impl RateLimiterConfig {
    /// Create a new rate limiter configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bucket capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the refill rate in tokens per second.
    #[must_use]
    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = rate;
        self
    }
}

/// Token bucket with lazy refill.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    fn new_at(config: RateLimiterConfig, now: Instant) -> Self {
        Self {
            capacity: f64::from(config.capacity),
            refill_rate: config.refill_rate,
            tokens: f64::from(config.capacity),
            last_refill: now,
        }
    }

    /// Withdraw one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Tokens currently in the bucket, refilled up to now.
    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }
}

/// Thread-safe rate limiter shared by every endpoint of one operation.
#[derive(Debug)]
pub struct RateLimiter {
    operation: String,
    config: RateLimiterConfig,
    bucket: Mutex<TokenBucket>,
    total_rejections: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    #[must_use]
    pub fn new(operation: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self {
            operation: operation.into(),
            config,
            bucket: Mutex::new(TokenBucket::new(config)),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Withdraw one token. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let acquired = self
            .bucket
            .lock()
            .expect("rate limiter lock poisoned")
            .try_acquire();
        if !acquired {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
        }
        acquired
    }

    /// The operation this limiter guards.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The limiter configuration.
    #[must_use]
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Number of calls rejected so far.
    #[must_use]
    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }
}

/// Endpoint decorator that withdraws a token before each call.
pub struct RateLimitedEndpoint<E> {
    inner: E,
    limiter: Arc<RateLimiter>,
}

impl<E> RateLimitedEndpoint<E> {
    /// Wrap `inner` with `limiter`.
    pub fn new(inner: E, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl<E, Req, Resp> Endpoint<Req, Resp> for RateLimitedEndpoint<E>
where
    E: Endpoint<Req, Resp>,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: &CallContext, request: Req) -> Result<Resp> {
        if ctx.is_done() {
            return Err(PipelineError::Cancelled);
        }
        if !self.limiter.try_acquire() {
            debug!(target: "resilient_rpc::rate_limit", operation = %self.limiter.operation(), "rate limit exceeded");
            return Err(PipelineError::RateLimited {
                operation: self.limiter.operation().to_string(),
            });
        }
        self.inner.call(ctx, request).await
    }
}
