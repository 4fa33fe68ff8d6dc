// SPDX-License-Identifier: MIT OR Apache-2.0

//! The client-side pipeline.
//!
//! A [`ResilientClient`] owns one complete pipeline for one operation:
//!
//! ```text
//! invoke -> Retry -> Balancer -> RateLimited -> CircuitBreaker -> Tracing -> transport
//!                        ^
//!                   Endpointer <- Instancer <- DiscoveryBackend
//! ```
//!
//! Construction spawns the discovery task; [`ResilientClient::shutdown`]
//! stops it and releases every live endpoint.
//!
//! # Example
//!
//! ```no_run
//! use resilient_rpc::client::{GrpcFactory, GrpcTransportConfig, ResilientClient, StaticDiscovery};
//! use resilient_rpc::config::PipelineConfig;
//! use resilient_rpc::endpoint::CallContext;
//! use std::time::Duration;
//!
//! #[derive(Clone, PartialEq, prost::Message)]
//! struct GetProduct {
//!     #[prost(string, tag = "1")]
//!     id: String,
//! }
//!
//! #[derive(Clone, PartialEq, prost::Message)]
//! struct Product {
//!     #[prost(string, tag = "1")]
//!     name: String,
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = GrpcFactory::<GetProduct, Product>::new(
//!     "/catalog.Catalog/GetProduct",
//!     GrpcTransportConfig::default(),
//! )?;
//! let client = ResilientClient::builder(PipelineConfig::new("GetProduct", "catalog"))
//!     .with_discovery(StaticDiscovery::from_addresses(["10.0.0.1:50051"]))
//!     .with_factory(factory)
//!     .build()?;
//!
//! let ctx = CallContext::with_timeout(Duration::from_secs(1));
//! let product = client.invoke(&ctx, GetProduct { id: "42".into() }).await?;
//! println!("{}", product.name);
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod discovery;
pub mod endpointer;
pub mod factory;
pub mod grpc;

pub use balancer::{Balancer, BalancerStrategy, RandomBalancer, RoundRobin};
pub use discovery::{
    DiscoveryBackend, Instance, InstanceEvent, Instancer, ServiceQuery, ServiceSnapshot,
    StaticDiscovery,
};
pub use endpointer::{Endpointer, EndpointerConfig, LiveEndpoint};
pub use factory::{factory_fn, Built, Closer, Factory, FnFactory, LayeredFactory, Layers, NopCloser};
pub use grpc::{ChannelHandle, GrpcEndpoint, GrpcFactory, GrpcTransportConfig, TlsConfig};

use crate::config::PipelineConfig;
use crate::endpoint::{BoxEndpoint, CallContext, Endpoint};
use crate::error::{PipelineError, Result};
use crate::runtime::{
    BackoffStrategy, BreakerObserver, CircuitBreaker, CircuitState, DefaultRetryPolicy,
    LogObserver, LoggingConfig, MetricsCollector, NoBackoff, RateLimiter, RequestLogger, Retry,
    RetryConfig, RetryPolicy, TracingConfig,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Reports breaker transitions to several observers.
struct Observers(Vec<Arc<dyn BreakerObserver>>);

impl BreakerObserver for Observers {
    fn on_transition(&self, operation: &str, from: CircuitState, to: CircuitState) {
        for observer in &self.0 {
            observer.on_transition(operation, from, to);
        }
    }
}

/// Builder for [`ResilientClient`].
pub struct ResilientClientBuilder<Req, Resp, P = DefaultRetryPolicy, B = NoBackoff> {
    config: PipelineConfig,
    discovery: Option<Arc<dyn DiscoveryBackend>>,
    factory: Option<Arc<dyn Factory<Req, Resp>>>,
    policy: P,
    backoff: B,
    metrics: Option<Arc<MetricsCollector>>,
    observer: Option<Arc<dyn BreakerObserver>>,
    logging: LoggingConfig,
    tracing: Option<TracingConfig>,
}

impl<Req, Resp> ResilientClientBuilder<Req, Resp> {
    /// Start from `config` with the default retry policy and no backoff.
    /// Spans report the configured service name.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        let tracing = TracingConfig::builder()
            .service_name(config.service_name.clone())
            .build();
        Self {
            config,
            discovery: None,
            factory: None,
            policy: DefaultRetryPolicy,
            backoff: NoBackoff,
            metrics: None,
            observer: None,
            logging: LoggingConfig::default(),
            tracing: Some(tracing),
        }
    }
}

impl<Req, Resp, P, B> ResilientClientBuilder<Req, Resp, P, B>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Send + 'static,
    P: RetryPolicy,
    B: BackoffStrategy,
{
    /// Discover instances through `backend`.
    #[must_use]
    pub fn with_discovery(mut self, backend: impl DiscoveryBackend) -> Self {
        self.discovery = Some(Arc::new(backend));
        self
    }

    /// Discover instances through a shared backend.
    #[must_use]
    pub fn with_shared_discovery(mut self, backend: Arc<dyn DiscoveryBackend>) -> Self {
        self.discovery = Some(backend);
        self
    }

    /// Build endpoints with `factory`.
    #[must_use]
    pub fn with_factory(mut self, factory: impl Factory<Req, Resp> + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Classify errors with `policy`.
    #[must_use]
    pub fn with_retry_policy<P2: RetryPolicy>(
        self,
        policy: P2,
    ) -> ResilientClientBuilder<Req, Resp, P2, B> {
        ResilientClientBuilder {
            config: self.config,
            discovery: self.discovery,
            factory: self.factory,
            policy,
            backoff: self.backoff,
            metrics: self.metrics,
            observer: self.observer,
            logging: self.logging,
            tracing: self.tracing,
        }
    }

    /// Wait between attempts according to `backoff`.
    #[must_use]
    pub fn with_backoff<B2: BackoffStrategy>(
        self,
        backoff: B2,
    ) -> ResilientClientBuilder<Req, Resp, P, B2> {
        ResilientClientBuilder {
            config: self.config,
            discovery: self.discovery,
            factory: self.factory,
            policy: self.policy,
            backoff,
            metrics: self.metrics,
            observer: self.observer,
            logging: self.logging,
            tracing: self.tracing,
        }
    }

    /// Record requests, retries, rejections and breaker state in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Also report breaker transitions to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn BreakerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Configure per-invocation logging.
    #[must_use]
    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Configure the per-attempt span.
    #[must_use]
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = Some(tracing);
        self
    }

    /// Skip the per-attempt span.
    #[must_use]
    pub fn without_tracing(mut self) -> Self {
        self.tracing = None;
        self
    }

    /// Assemble the pipeline and start discovery.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid or the discovery
    /// backend or factory is missing.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<ResilientClient<Req, Resp>> {
        self.config.validate()?;
        let discovery = self
            .discovery
            .ok_or_else(|| PipelineError::Config("no discovery backend configured".to_string()))?;
        let factory = self
            .factory
            .ok_or_else(|| PipelineError::Config("no endpoint factory configured".to_string()))?;
        let config = self.config;
        let operation = config.operation_name.clone();

        let mut observers: Vec<Arc<dyn BreakerObserver>> = vec![Arc::new(LogObserver)];
        if let Some(metrics) = &self.metrics {
            metrics.set_circuit_breaker_state(&operation, CircuitState::Closed);
            observers.push(metrics.clone());
        }
        observers.extend(self.observer);

        let limiter = Arc::new(RateLimiter::new(&operation, config.limiter_config()));
        let breaker = Arc::new(CircuitBreaker::with_observer(
            &operation,
            config.breaker_config(),
            Arc::new(Observers(observers)),
        ));

        let mut layers = Layers::new(&operation)
            .with_limiter(limiter.clone())
            .with_breaker(breaker.clone());
        if let Some(tracing) = self.tracing {
            layers = layers.with_tracing(tracing);
        }
        let factory: Arc<dyn Factory<Req, Resp>> =
            Arc::new(LayeredFactory::new(factory, layers));

        let mut endpointer = Endpointer::new(config.endpointer_config(), factory);
        if let Some(metrics) = &self.metrics {
            endpointer = endpointer.with_metrics(metrics.clone());
        }
        let endpointer = Arc::new(endpointer);

        let instancer = Instancer::spawn(
            discovery,
            config.service_query(),
            config.discovery_queue_capacity,
        );
        let (shutdown, stop) = watch::channel(false);
        let task = endpointer.clone().follow(instancer, stop);

        let retry_config = RetryConfig::builder()
            .max_attempts(config.max_retry_attempts)
            .deadline(config.retry_deadline)
            .policy(self.policy)
            .backoff(self.backoff)
            .build();
        let mut retry = Retry::new(
            &operation,
            config.balancer.build(endpointer.clone()),
            retry_config,
        );
        if let Some(metrics) = &self.metrics {
            retry = retry.with_metrics(metrics.clone());
        }

        info!(
            target: "resilient_rpc::client",
            operation = %operation,
            service = %config.service_name,
            "pipeline started"
        );

        Ok(ResilientClient {
            pipeline: Arc::new(retry),
            endpointer,
            limiter,
            breaker,
            metrics: self.metrics,
            logger: RequestLogger::with_config(self.logging),
            shutdown,
            task: Mutex::new(Some(task)),
            config,
        })
    }
}

/// One resilient pipeline for one operation on one service.
pub struct ResilientClient<Req, Resp> {
    config: PipelineConfig,
    pipeline: BoxEndpoint<Req, Resp>,
    endpointer: Arc<Endpointer<Req, Resp>>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    metrics: Option<Arc<MetricsCollector>>,
    logger: RequestLogger,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<Req, Resp> ResilientClient<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Send + 'static,
{
    /// Start building a pipeline from `config`.
    #[must_use]
    pub fn builder(config: PipelineConfig) -> ResilientClientBuilder<Req, Resp> {
        ResilientClientBuilder::new(config)
    }

    /// Call the operation.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `ctx` fires, the first non-retryable error
    /// as is, or `RetriesExhausted` wrapping the last error once the attempt
    /// cap or retry deadline is reached.
    pub async fn invoke(&self, ctx: &CallContext, request: Req) -> Result<Resp> {
        let operation = &self.config.operation_name;
        let span = self.logger.start(operation, ctx);
        let started = Instant::now();

        let result = self.pipeline.call(ctx, request).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_request(operation, result.is_ok(), started.elapsed());
            if let Err(e) = &result {
                match e.last_error() {
                    PipelineError::RateLimited { .. } => metrics.record_rate_limited(operation),
                    PipelineError::CircuitOpen { .. } => {
                        metrics.record_circuit_breaker_rejection();
                    }
                    _ => {}
                }
            }
        }
        self.logger.finish(span, &result);
        result
    }

    /// Wait until at least `min` endpoints are live.
    ///
    /// # Errors
    ///
    /// Returns `NoEndpointsAvailable` if `timeout` passes first.
    pub async fn wait_for_endpoints(&self, min: usize, timeout: Duration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let live = self.endpointer.len();
            if live >= min {
                return Ok(live);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(self.endpointer.no_endpoints());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl<Req, Resp> ResilientClient<Req, Resp> {
    /// The pipeline parameters.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Number of live endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpointer.len()
    }

    /// The live instances, sorted.
    #[must_use]
    pub fn instances(&self) -> Vec<Instance> {
        self.endpointer.instances()
    }

    /// The operation's circuit breaker.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The operation's rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The metrics collector, if one was configured.
    #[must_use]
    pub fn metrics(&self) -> Option<&Arc<MetricsCollector>> {
        self.metrics.as_ref()
    }

    /// The request logger and its counters.
    #[must_use]
    pub fn logger(&self) -> &RequestLogger {
        &self.logger
    }

    /// Stop discovery and release every live endpoint.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().expect("lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.endpointer.close().await;
        info!(
            target: "resilient_rpc::client",
            operation = %self.config.operation_name,
            "pipeline stopped"
        );
    }
}

impl<Req, Resp> Drop for ResilientClient<Req, Resp> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[async_trait]
impl<Req, Resp> Endpoint<Req, Resp> for ResilientClient<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: &CallContext, request: Req) -> Result<Resp> {
        self.invoke(ctx, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{InMemoryDiscovery, MockFactory, Step};

    fn client(
        factory: &MockFactory,
        addresses: &[&str],
        config: PipelineConfig,
    ) -> ResilientClient<String, String> {
        ResilientClient::builder(config)
            .with_discovery(StaticDiscovery::from_addresses(addresses.iter().copied()))
            .with_factory(factory.clone())
            .build()
            .unwrap()
    }

    fn ctx() -> CallContext {
        CallContext::with_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_build_requires_discovery_and_factory() {
        let missing_discovery = ResilientClient::<String, String>::builder(PipelineConfig::default())
            .with_factory(MockFactory::new())
            .build();
        assert!(matches!(missing_discovery, Err(PipelineError::Config(_))));

        let missing_factory = ResilientClient::<String, String>::builder(PipelineConfig::default())
            .with_discovery(StaticDiscovery::default())
            .build();
        assert!(matches!(missing_factory, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_spans_default_to_configured_service() {
        let builder =
            ResilientClient::<String, String>::builder(PipelineConfig::new("Get", "products"));
        let tracing = builder.tracing.as_ref().unwrap();
        assert_eq!(tracing.service_name, "products");

        let custom = builder.with_tracing(TracingConfig::builder().service_name("catalog").build());
        assert_eq!(custom.tracing.unwrap().service_name, "catalog");
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let result = ResilientClient::<String, String>::builder(
            PipelineConfig::default().with_max_retry_attempts(0),
        )
        .with_discovery(StaticDiscovery::default())
        .with_factory(MockFactory::new())
        .build();

        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_invoke_round_robins_over_discovered_instances() {
        let factory = MockFactory::new();
        let client = client(&factory, &["b:1", "a:1"], PipelineConfig::new("Get", "svc"));
        client
            .wait_for_endpoints(2, Duration::from_secs(1))
            .await
            .unwrap();

        let first = client.invoke(&ctx(), "x".to_string()).await.unwrap();
        let second = client.invoke(&ctx(), "x".to_string()).await.unwrap();

        assert_eq!(first, "a:1:x");
        assert_eq!(second, "b:1:x");
        assert_eq!(client.logger().counters().successful_requests(), 2);
    }

    #[tokio::test]
    async fn test_invoke_without_endpoints() {
        let factory = MockFactory::new();
        let client = client(&factory, &[], PipelineConfig::new("Get", "svc"));

        let err = client.invoke(&ctx(), "x".to_string()).await.unwrap_err();

        assert!(matches!(err, PipelineError::NoEndpointsAvailable { ref service } if service == "svc"));
    }

    #[tokio::test]
    async fn test_retry_moves_to_next_instance() {
        let factory = MockFactory::new();
        factory.script("a:1", vec![Step::Transport]);
        let client = client(&factory, &["a:1", "b:1"], PipelineConfig::new("Get", "svc"));
        client
            .wait_for_endpoints(2, Duration::from_secs(1))
            .await
            .unwrap();

        let reply = client.invoke(&ctx(), "x".to_string()).await.unwrap();

        assert_eq!(reply, "b:1:x");
        assert_eq!(factory.calls("a:1"), 1);
    }

    #[tokio::test]
    async fn test_metrics_record_outcomes() {
        let factory = MockFactory::new();
        let metrics = Arc::new(MetricsCollector::with_defaults());
        let client = ResilientClient::builder(
            PipelineConfig::new("Get", "svc").with_limiter(1, 0.001),
        )
        .with_discovery(StaticDiscovery::from_addresses(["a:1"]))
        .with_factory(factory.clone())
        .with_metrics(metrics.clone())
        .build()
        .unwrap();
        client
            .wait_for_endpoints(1, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(client.invoke(&ctx(), "x".to_string()).await.is_ok());
        let err = client.invoke(&ctx(), "x".to_string()).await.unwrap_err();

        assert!(matches!(err, PipelineError::RateLimited { .. }));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.rate_limited, 1);
        assert!(metrics.to_prometheus_text().contains("live_endpoints"));
    }

    #[tokio::test]
    async fn test_instance_failing_first_build_joins_later() {
        let factory = MockFactory::new();
        factory.fail_builds_for("a:1", 1);
        let client = client(&factory, &["a:1"], PipelineConfig::new("Get", "svc"));

        client
            .wait_for_endpoints(1, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(client.invoke(&ctx(), "x".to_string()).await.unwrap(), "a:1:x");
        assert_eq!(factory.builds("a:1"), 2);
    }

    #[tokio::test]
    async fn test_shutdown_releases_endpoints() {
        let factory = MockFactory::new();
        let registry = InMemoryDiscovery::new();
        registry.set_instances(vec![Instance::new("a:1"), Instance::new("b:1")]);
        let client = ResilientClient::builder(PipelineConfig::new("Get", "svc"))
            .with_discovery(registry.clone())
            .with_factory(factory.clone())
            .build()
            .unwrap();
        client
            .wait_for_endpoints(2, Duration::from_secs(1))
            .await
            .unwrap();

        client.shutdown().await;
        registry.set_instances(vec![Instance::new("c:1")]);

        assert_eq!(client.endpoint_count(), 0);
        assert_eq!(factory.closes("a:1"), 1);
        assert_eq!(factory.closes("b:1"), 1);
        assert_eq!(factory.builds("c:1"), 0);
    }
}
