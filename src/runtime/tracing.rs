// SPDX-License-Identifier: MIT OR Apache-2.0

//! Span-per-call tracing middleware.
//!
//! [`TracingEndpoint`] opens an `rpc.client` span around every call to the
//! endpoint it wraps and records the outcome on it. It never alters the
//! result. Export to an OpenTelemetry backend is left to the subscriber the
//! application installs; this crate only depends on `tracing`.
//!
//! # Semantic Conventions
//!
//! | Attribute | Description |
//! |-----------|-------------|
//! | `rpc.system` | Always "grpc" |
//! | `rpc.service` | Logical service name (e.g., "products") |
//! | `rpc.method` | Operation name (e.g., "GetProducts") |
//! | `server.address` | Instance address the call went to |
//! | `rpc.metadata_count` | Number of caller metadata entries |
//! | `rpc.grpc.status_code` | gRPC status code of the outcome |
//!
//! # Example
//!
//! ```rust
//! use resilient_rpc::runtime::CallSpan;
//! use std::time::Duration;
//!
//! let span = CallSpan::new("GetProducts", "products", "10.0.0.1:8080");
//! span.record_success(Duration::from_millis(42));
//! ```

use crate::endpoint::{CallContext, Endpoint};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{field, info_span, Instrument, Span};

/// Configuration for call tracing.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name recorded as `rpc.service`
    pub service_name: String,
    /// Emit caller metadata keys (never values) as an event inside the span
    pub record_metadata_keys: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "resilient-rpc".to_string(),
            record_metadata_keys: false,
        }
    }
}

impl TracingConfig {
    /// Create a new builder for `TracingConfig`.
    pub fn builder() -> TracingConfigBuilder {
        TracingConfigBuilder::default()
    }
}

/// Builder for `TracingConfig`.
#[derive(Debug, Default)]
pub struct TracingConfigBuilder {
    service_name: Option<String>,
    record_metadata_keys: Option<bool>,
}

impl TracingConfigBuilder {
    /// Set the service name for spans.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Emit metadata keys inside each span.
    pub fn record_metadata_keys(mut self, enabled: bool) -> Self {
        self.record_metadata_keys = Some(enabled);
        self
    }

    /// Build the `TracingConfig`.
    pub fn build(self) -> TracingConfig {
        let default = TracingConfig::default();
        TracingConfig {
            service_name: self.service_name.unwrap_or(default.service_name),
            record_metadata_keys: self
                .record_metadata_keys
                .unwrap_or(default.record_metadata_keys),
        }
    }
}

/// A span for one endpoint call with OpenTelemetry attributes.
#[derive(Debug)]
pub struct CallSpan {
    span: Span,
    start: Instant,
    operation: String,
    address: String,
}

impl CallSpan {
    /// Create a new span for a call to `operation` on `address`.
    pub fn new(operation: &str, service: &str, address: &str) -> Self {
        let span = info_span!(
            "rpc.client",
            rpc.system = "grpc",
            rpc.service = %service,
            rpc.method = %operation,
            server.address = %address,
            rpc.metadata_count = field::Empty,
            rpc.grpc.status_code = field::Empty,
            otel.status_code = field::Empty,
            error.message = field::Empty,
            duration_ms = field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            operation: operation.to_string(),
            address: address.to_string(),
        }
    }

    /// Get the underlying `tracing::Span`.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Get the operation name.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Get the instance address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get elapsed time since span creation.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record how many metadata entries the caller attached.
    pub fn record_metadata_count(&self, count: usize) {
        self.span.record("rpc.metadata_count", count);
    }

    /// Record a successful response.
    pub fn record_success(&self, duration: Duration) {
        self.span.record("rpc.grpc.status_code", 0i64);
        self.span.record("otel.status_code", "OK");
        self.span.record("duration_ms", millis(duration));
    }

    /// Record a failed call.
    pub fn record_error(&self, error: &PipelineError) {
        let code = match error {
            PipelineError::Api(status) => status.code() as i64,
            PipelineError::Cancelled => tonic::Code::Cancelled as i64,
            PipelineError::Transport(_) => tonic::Code::Unavailable as i64,
            _ => tonic::Code::Unknown as i64,
        };
        self.span.record("rpc.grpc.status_code", code);
        self.span.record("otel.status_code", "ERROR");
        self.span.record("error.message", error.to_string().as_str());
        self.span.record("duration_ms", millis(self.start.elapsed()));
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Endpoint decorator that wraps each call in a [`CallSpan`].
pub struct TracingEndpoint<E> {
    inner: E,
    config: TracingConfig,
    operation: String,
    address: String,
}

impl<E> TracingEndpoint<E> {
    /// Trace calls to `operation` on the instance at `address`.
    pub fn new(
        inner: E,
        config: TracingConfig,
        operation: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            config,
            operation: operation.into(),
            address: address.into(),
        }
    }
}

#[async_trait]
impl<E, Req, Resp> Endpoint<Req, Resp> for TracingEndpoint<E>
where
    E: Endpoint<Req, Resp>,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: &CallContext, request: Req) -> Result<Resp> {
        let span = CallSpan::new(&self.operation, &self.config.service_name, &self.address);
        span.record_metadata_count(ctx.metadata().len());
        if self.config.record_metadata_keys && !ctx.metadata().is_empty() {
            let keys: Vec<&str> = ctx.metadata().keys().map(String::as_str).collect();
            span.span().in_scope(|| tracing::debug!(metadata = ?keys, "call metadata"));
        }

        let result = self
            .inner
            .call(ctx, request)
            .instrument(span.span().clone())
            .await;

        match &result {
            Ok(_) => span.record_success(span.elapsed()),
            Err(e) => span.record_error(e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::endpoint_fn;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tracing::field::{Field, Visit};
    use tracing::span::{Attributes, Id, Record};
    use tracing::Subscriber;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
    use tracing_subscriber::registry::LookupSpan;

    type Fields = HashMap<String, String>;

    struct FieldVisitor<'a>(&'a mut Fields);

    impl Visit for FieldVisitor<'_> {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    /// Collects the fields of every closed span, in close order.
    #[derive(Clone, Default)]
    struct SpanCapture(Arc<Mutex<Vec<(String, Fields)>>>);

    impl SpanCapture {
        fn spans(&self, name: &str) -> Vec<Fields> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _)| n == name)
                .map(|(_, f)| f.clone())
                .collect()
        }
    }

    impl<S> Layer<S> for SpanCapture
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
            let mut fields = Fields::new();
            attrs.record(&mut FieldVisitor(&mut fields));
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(fields);
            }
        }

        fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
            if let Some(span) = ctx.span(id) {
                if let Some(fields) = span.extensions_mut().get_mut::<Fields>() {
                    values.record(&mut FieldVisitor(fields));
                }
            }
        }

        fn on_close(&self, id: Id, ctx: Context<'_, S>) {
            if let Some(span) = ctx.span(&id) {
                let fields = span.extensions_mut().remove::<Fields>().unwrap_or_default();
                self.0
                    .lock()
                    .unwrap()
                    .push((span.name().to_string(), fields));
            }
        }
    }

    fn capture() -> (SpanCapture, tracing::subscriber::DefaultGuard) {
        let capture = SpanCapture::default();
        let guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(capture.clone()),
        );
        (capture, guard)
    }

    #[test]
    fn test_tracing_config_builder() {
        let config = TracingConfig::builder()
            .service_name("products")
            .record_metadata_keys(true)
            .build();

        assert_eq!(config.service_name, "products");
        assert!(config.record_metadata_keys);
        assert!(!TracingConfig::default().record_metadata_keys);
    }

    #[test]
    fn test_call_span_new() {
        let span = CallSpan::new("GetProducts", "products", "10.0.0.1:8080");
        assert_eq!(span.operation(), "GetProducts");
        assert_eq!(span.address(), "10.0.0.1:8080");
    }

    #[test]
    fn test_call_span_records_success() {
        let (capture, _guard) = capture();

        let span = CallSpan::new("GetProducts", "products", "10.0.0.1:8080");
        span.record_metadata_count(2);
        span.record_success(Duration::from_millis(42));
        drop(span);

        let spans = capture.spans("rpc.client");
        assert_eq!(spans.len(), 1);
        let fields = &spans[0];
        assert_eq!(fields["rpc.system"], "grpc");
        assert_eq!(fields["rpc.service"], "products");
        assert_eq!(fields["rpc.method"], "GetProducts");
        assert_eq!(fields["server.address"], "10.0.0.1:8080");
        assert_eq!(fields["rpc.metadata_count"], "2");
        assert_eq!(fields["rpc.grpc.status_code"], "0");
        assert_eq!(fields["otel.status_code"], "OK");
        assert_eq!(fields["duration_ms"], "42");
        assert!(!fields.contains_key("error.message"));
    }

    #[test]
    fn test_call_span_records_transport_error() {
        let (capture, _guard) = capture();

        let span = CallSpan::new("GetProducts", "products", "10.0.0.1:8080");
        span.record_error(&PipelineError::Transport("reset".to_string()));
        drop(span);

        let spans = capture.spans("rpc.client");
        assert_eq!(spans.len(), 1);
        let fields = &spans[0];
        assert_eq!(
            fields["rpc.grpc.status_code"],
            (tonic::Code::Unavailable as i64).to_string()
        );
        assert_eq!(fields["otel.status_code"], "ERROR");
        assert_eq!(fields["error.message"], "Transport error: reset");
        assert!(fields["duration_ms"].parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn test_tracing_endpoint_records_outcome_and_passes_result_through() {
        let (capture, _guard) = capture();
        let ctx = CallContext::background().with_metadata("request-id", "r1");

        let ok = TracingEndpoint::new(
            endpoint_fn(|_ctx, n: u32| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(n + 1)
            }),
            TracingConfig::builder().service_name("products").build(),
            "Inc",
            "10.0.0.1:8080",
        );
        assert_eq!(ok.call(&ctx, 1).await.unwrap(), 2);

        let failing = TracingEndpoint::new(
            endpoint_fn(|_ctx, _n: u32| async move {
                Err::<u32, _>(PipelineError::Api(tonic::Status::invalid_argument("bad")))
            }),
            TracingConfig::builder()
                .service_name("products")
                .record_metadata_keys(true)
                .build(),
            "Inc",
            "10.0.0.2:8080",
        );
        let err = failing.call(&ctx, 1).await.unwrap_err();
        assert!(matches!(err, PipelineError::Api(ref s) if s.code() == tonic::Code::InvalidArgument));

        let spans = capture.spans("rpc.client");
        assert_eq!(spans.len(), 2);

        let success = &spans[0];
        assert_eq!(success["server.address"], "10.0.0.1:8080");
        assert_eq!(success["rpc.service"], "products");
        assert_eq!(success["rpc.metadata_count"], "1");
        assert_eq!(success["otel.status_code"], "OK");
        assert!(success["duration_ms"].parse::<u64>().unwrap() >= 20);

        let failure = &spans[1];
        assert_eq!(failure["server.address"], "10.0.0.2:8080");
        assert_eq!(failure["otel.status_code"], "ERROR");
        assert_eq!(
            failure["rpc.grpc.status_code"],
            (tonic::Code::InvalidArgument as i64).to_string()
        );
        assert!(failure["error.message"].contains("bad"));
        assert!(failure.contains_key("duration_ms"));
    }
}
