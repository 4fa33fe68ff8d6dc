// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured logging of client invocations.
//!
//! [`RequestLogger`] brackets each `invoke`: it logs the outcome with timing,
//! caller metadata (sensitive keys redacted) and error details, and keeps
//! success/failure counters.
//!
//! # Example
//!
//! ```
//! use resilient_rpc::endpoint::CallContext;
//! use resilient_rpc::runtime::{LogLevel, LoggingConfig, RequestLogger};
//!
//! let logger = RequestLogger::with_config(
//!     LoggingConfig::new().with_success_level(LogLevel::Debug),
//! );
//! let ctx = CallContext::background().with_metadata("request-id", "r-42");
//! let span = logger.start("GetProducts", &ctx);
//! logger.finish_success(span);
//! assert_eq!(logger.counters().successful_requests(), 1);
//! ```

use crate::endpoint::CallContext;
use crate::error::PipelineError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Log level for invocation logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Trace level - most verbose.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warn level.
    Warn,
    /// Error level - only errors.
    Error,
    /// Disabled - no logging.
    Off,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Off => write!(f, "OFF"),
        }
    }
}

fn default_sensitive_keys() -> Vec<String> {
    vec![
        "authorization".to_string(),
        "x-api-key".to_string(),
        "x-auth-token".to_string(),
    ]
}

/// Configuration for invocation logging.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level for successful calls.
    pub success_level: LogLevel,
    /// Log level for failed calls.
    pub error_level: LogLevel,
    /// Whether to log caller metadata.
    pub log_metadata: bool,
    /// Whether to redact sensitive metadata values.
    pub redact_sensitive: bool,
    /// Metadata keys whose values are redacted.
    pub sensitive_keys: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            success_level: LogLevel::Info,
            error_level: LogLevel::Error,
            log_metadata: true,
            redact_sensitive: true,
            sensitive_keys: default_sensitive_keys(),
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the success log level.
    #[must_use]
    pub fn with_success_level(mut self, level: LogLevel) -> Self {
        self.success_level = level;
        self
    }

    /// Set the error log level.
    #[must_use]
    pub fn with_error_level(mut self, level: LogLevel) -> Self {
        self.error_level = level;
        self
    }

    /// Enable or disable metadata logging.
    #[must_use]
    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.log_metadata = enabled;
        self
    }

    /// Enable or disable sensitive value redaction.
    #[must_use]
    pub fn with_redaction(mut self, enabled: bool) -> Self {
        self.redact_sensitive = enabled;
        self
    }

    /// Add a metadata key to redact.
    #[must_use]
    pub fn with_sensitive_key(mut self, key: impl Into<String>) -> Self {
        self.sensitive_keys.push(key.into());
        self
    }

    /// Create a verbose configuration for debugging.
    #[must_use]
    pub fn verbose() -> Self {
        Self {
            success_level: LogLevel::Debug,
            ..Self::default()
        }
    }

    /// Create a quiet configuration for production.
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            success_level: LogLevel::Off,
            error_level: LogLevel::Warn,
            log_metadata: false,
            ..Self::default()
        }
    }

    fn is_sensitive(&self, key: &str) -> bool {
        self.redact_sensitive
            && self
                .sensitive_keys
                .iter()
                .any(|k| k.eq_ignore_ascii_case(key))
    }
}

/// Success and failure counters kept by the [`RequestLogger`].
#[derive(Debug, Default)]
pub struct CallCounters {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl CallCounters {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the total number of calls.
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Get the number of successful calls.
    #[must_use]
    pub fn successful_requests(&self) -> u64 {
        self.successful_requests.load(Ordering::Relaxed)
    }

    /// Get the number of failed calls.
    #[must_use]
    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    /// Get the success rate (0.0 to 1.0).
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 1.0;
        }
        self.successful_requests() as f64 / total as f64
    }

    /// Reset all counters.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
    }
}

/// An in-flight invocation tracked by the [`RequestLogger`].
#[derive(Debug)]
pub struct RequestSpan {
    operation: String,
    metadata: String,
    start: Instant,
}

impl RequestSpan {
    /// The operation being invoked.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Elapsed time since the invocation started.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

/// Logs every invocation with timing and outcome.
#[derive(Debug, Default)]
pub struct RequestLogger {
    config: LoggingConfig,
    counters: CallCounters,
}

impl RequestLogger {
    /// Create a new request logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a request logger with custom configuration.
    #[must_use]
    pub fn with_config(config: LoggingConfig) -> Self {
        Self {
            config,
            counters: CallCounters::new(),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }

    /// Get the counters.
    #[must_use]
    pub fn counters(&self) -> &CallCounters {
        &self.counters
    }

    /// Start tracking an invocation of `operation`.
    #[must_use]
    pub fn start(&self, operation: &str, ctx: &CallContext) -> RequestSpan {
        RequestSpan {
            operation: operation.to_string(),
            metadata: self.render_metadata(ctx),
            start: Instant::now(),
        }
    }

    /// Finish tracking an invocation that succeeded.
    pub fn finish_success(&self, span: RequestSpan) {
        self.counters.record_success();
        let msg = format!(
            "{} completed in {:?}{}",
            span.operation,
            span.start.elapsed(),
            span.metadata
        );
        emit(self.config.success_level, &msg);
    }

    /// Finish tracking an invocation that failed.
    pub fn finish_failure(&self, span: RequestSpan, err: &PipelineError) {
        self.counters.record_failure();
        let msg = format!(
            "{} failed after {:?}: {err}{}",
            span.operation,
            span.start.elapsed(),
            span.metadata
        );
        emit(self.config.error_level, &msg);
    }

    /// Finish tracking an invocation with its result.
    pub fn finish<T>(&self, span: RequestSpan, result: &crate::error::Result<T>) {
        match result {
            Ok(_) => self.finish_success(span),
            Err(e) => self.finish_failure(span, e),
        }
    }

    fn render_metadata(&self, ctx: &CallContext) -> String {
        if !self.config.log_metadata || ctx.metadata().is_empty() {
            return String::new();
        }
        let parts: Vec<String> = ctx
            .metadata()
            .iter()
            .map(|(key, value)| {
                if self.config.is_sensitive(key) {
                    format!("{key}=[REDACTED]")
                } else {
                    format!("{key}={value}")
                }
            })
            .collect();
        format!(" metadata=[{}]", parts.join(", "))
    }
}

fn emit(level: LogLevel, msg: &str) {
    match level {
        LogLevel::Trace => trace!(target: "resilient_rpc::client", "{}", msg),
        LogLevel::Debug => debug!(target: "resilient_rpc::client", "{}", msg),
        LogLevel::Info => info!(target: "resilient_rpc::client", "{}", msg),
        LogLevel::Warn => warn!(target: "resilient_rpc::client", "{}", msg),
        LogLevel::Error => error!(target: "resilient_rpc::client", "{}", msg),
        LogLevel::Off => {}
    }
}
