// SPDX-License-Identifier: MIT OR Apache-2.0

//! Building endpoints for discovered instances.
//!
//! A [`Factory`] turns one [`Instance`] into a callable endpoint plus the
//! [`Closer`] that releases its network resource. [`LayeredFactory`] wraps
//! whatever the inner factory builds in the per-operation middleware stack:
//!
//! ```text
//! RateLimitedEndpoint -> CircuitBreakerEndpoint -> TracingEndpoint -> transport
//! ```
//!
//! The limiter and breaker are shared by every instance of the operation.

use crate::client::discovery::Instance;
use crate::endpoint::{BoxEndpoint, Endpoint};
use crate::error::Result;
use crate::runtime::{
    CircuitBreaker, CircuitBreakerEndpoint, RateLimitedEndpoint, RateLimiter, TracingConfig,
    TracingEndpoint,
};
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Releases the network resource behind one live endpoint.
pub trait Closer: Send + Sync {
    /// Release the resource. Called at most once per built endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource could not be released cleanly.
    fn close(&self) -> Result<()>;
}

impl<C: Closer + ?Sized> Closer for Arc<C> {
    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// A closer with nothing to release.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopCloser;

impl Closer for NopCloser {
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Endpoint and closer produced for one instance.
pub type Built<Req, Resp> = (BoxEndpoint<Req, Resp>, Box<dyn Closer>);

/// Builds live endpoints for discovered instances.
#[async_trait]
pub trait Factory<Req, Resp>: Send + Sync {
    /// Connect to `instance`.
    ///
    /// # Errors
    ///
    /// Returns `Construction` when the instance cannot be reached. Other
    /// instances are unaffected.
    async fn build(&self, instance: &Instance) -> Result<Built<Req, Resp>>;
}

#[async_trait]
impl<Req, Resp, F> Factory<Req, Resp> for Arc<F>
where
    Req: Send + 'static,
    F: Factory<Req, Resp> + ?Sized,
{
    async fn build(&self, instance: &Instance) -> Result<Built<Req, Resp>> {
        (**self).build(instance).await
    }
}

/// Factory backed by an async closure.
pub struct FnFactory<F, Req, Resp> {
    f: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

/// Build a [`Factory`] from an async closure over the instance.
pub fn factory_fn<F, Fut, Req, Resp>(f: F) -> FnFactory<F, Req, Resp>
where
    F: Fn(Instance) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Built<Req, Resp>>> + Send + 'static,
{
    FnFactory {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, Req, Resp> Factory<Req, Resp> for FnFactory<F, Req, Resp>
where
    F: Fn(Instance) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Built<Req, Resp>>> + Send + 'static,
    Req: Send + 'static,
    Resp: 'static,
{
    async fn build(&self, instance: &Instance) -> Result<Built<Req, Resp>> {
        (self.f)(instance.clone()).await
    }
}

/// Per-operation middleware applied to every built endpoint.
#[derive(Clone, Default)]
pub struct Layers {
    operation: String,
    limiter: Option<Arc<RateLimiter>>,
    breaker: Option<Arc<CircuitBreaker>>,
    tracing: Option<TracingConfig>,
}

impl Layers {
    /// No middleware for `operation`.
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    /// Guard calls with `limiter`.
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Guard calls with `breaker`.
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Open a span around each call.
    #[must_use]
    pub fn with_tracing(mut self, config: TracingConfig) -> Self {
        self.tracing = Some(config);
        self
    }

    /// The operation name.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Wrap `endpoint`, built for `instance`, in the configured layers.
    pub fn apply<Req, Resp>(
        &self,
        instance: &Instance,
        endpoint: BoxEndpoint<Req, Resp>,
    ) -> BoxEndpoint<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let mut endpoint = endpoint;
        if let Some(config) = &self.tracing {
            endpoint = wrap(TracingEndpoint::new(
                endpoint,
                config.clone(),
                self.operation.clone(),
                instance.address.clone(),
            ));
        }
        if let Some(breaker) = &self.breaker {
            endpoint = wrap(CircuitBreakerEndpoint::new(endpoint, breaker.clone()));
        }
        if let Some(limiter) = &self.limiter {
            endpoint = wrap(RateLimitedEndpoint::new(endpoint, limiter.clone()));
        }
        endpoint
    }
}

fn wrap<Req, Resp, E>(endpoint: E) -> BoxEndpoint<Req, Resp>
where
    Req: Send + 'static,
    E: Endpoint<Req, Resp> + 'static,
{
    Arc::new(endpoint)
}

/// Factory decorator applying [`Layers`] to every endpoint it builds.
pub struct LayeredFactory<F> {
    inner: F,
    layers: Layers,
}

impl<F> LayeredFactory<F> {
    /// Wrap the endpoints built by `inner` in `layers`.
    pub fn new(inner: F, layers: Layers) -> Self {
        Self { inner, layers }
    }
}

#[async_trait]
impl<F, Req, Resp> Factory<Req, Resp> for LayeredFactory<F>
where
    F: Factory<Req, Resp>,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn build(&self, instance: &Instance) -> Result<Built<Req, Resp>> {
        let (endpoint, closer) = self.inner.build(instance).await?;
        Ok((self.layers.apply(instance, endpoint), closer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{endpoint_fn, CallContext};
    use crate::error::PipelineError;
    use crate::runtime::{CircuitBreakerConfig, RateLimiterConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_factory(calls: Arc<AtomicUsize>) -> impl Factory<u32, u32> {
        factory_fn(move |_instance: Instance| {
            let calls = calls.clone();
            async move {
                let endpoint: BoxEndpoint<u32, u32> = Arc::new(endpoint_fn(move |_ctx, n: u32| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(n)
                    }
                }));
                Ok((endpoint, Box::new(NopCloser) as Box<dyn Closer>))
            }
        })
    }

    #[tokio::test]
    async fn test_factory_fn_builds_endpoint() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = echo_factory(calls.clone());

        let (endpoint, closer) = factory.build(&Instance::new("a:1")).await.unwrap();

        assert_eq!(endpoint.call(&CallContext::background(), 5).await.unwrap(), 5);
        assert!(closer.close().is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_factory_fn_reports_construction_error() {
        let factory = factory_fn(|instance: Instance| async move {
            Err::<Built<u32, u32>, _>(PipelineError::Construction {
                instance: instance.address,
                reason: "connection refused".to_string(),
            })
        });

        let err = factory.build(&Instance::new("a:1")).await.err().unwrap();
        assert!(matches!(err, PipelineError::Construction { ref instance, .. } if instance == "a:1"));
    }

    #[tokio::test]
    async fn test_layers_share_limiter_across_instances() {
        let calls = Arc::new(AtomicUsize::new(0));
        let limiter = Arc::new(RateLimiter::new(
            "Echo",
            RateLimiterConfig::new().with_capacity(2).with_refill_rate(0.001),
        ));
        let factory = LayeredFactory::new(
            echo_factory(calls.clone()),
            Layers::new("Echo")
                .with_limiter(limiter.clone())
                .with_tracing(TracingConfig::default()),
        );
        let ctx = CallContext::background();

        let (a, _) = factory.build(&Instance::new("a:1")).await.unwrap();
        let (b, _) = factory.build(&Instance::new("b:1")).await.unwrap();

        assert!(a.call(&ctx, 1).await.is_ok());
        assert!(b.call(&ctx, 2).await.is_ok());
        assert!(matches!(
            a.call(&ctx, 3).await,
            Err(PipelineError::RateLimited { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_limiter_runs_before_breaker() {
        let limiter = Arc::new(RateLimiter::new(
            "Echo",
            RateLimiterConfig::new().with_capacity(0),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            "Echo",
            CircuitBreakerConfig::new().with_failure_threshold(1),
        ));
        let factory = LayeredFactory::new(
            echo_factory(Arc::new(AtomicUsize::new(0))),
            Layers::new("Echo")
                .with_limiter(limiter)
                .with_breaker(breaker.clone()),
        );

        let (endpoint, _) = factory.build(&Instance::new("a:1")).await.unwrap();
        let err = endpoint.call(&CallContext::background(), 1).await.unwrap_err();

        // Rejected by the limiter, so the breaker never saw a failure.
        assert!(matches!(err, PipelineError::RateLimited { .. }));
        assert_eq!(breaker.total_calls(), 0);
    }
}
