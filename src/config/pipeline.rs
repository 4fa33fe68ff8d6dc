// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pipeline configuration file parser
//!
//! A pipeline is described by one YAML document. Every key is optional;
//! durations are given in milliseconds.
//!
//! ```yaml
//! operation_name: GetProduct
//! service_name: products
//! tags: [v2]
//! max_retry_attempts: 3
//! retry_deadline_ms: 500
//! breaker_failure_threshold: 5
//! breaker_open_timeout_ms: 5000
//! limiter_capacity: 100
//! limiter_refill_rate: 100.0
//! balancer: round_robin
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::balancer::BalancerStrategy;
use crate::client::discovery::ServiceQuery;
use crate::client::endpointer::EndpointerConfig;
use crate::error::{PipelineError, Result};
use crate::runtime::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};

/// Environment variable pointing at the config file.
pub const ENV_CONFIG: &str = "RESILIENT_RPC_CONFIG";
/// Environment variable overriding the service name.
pub const ENV_SERVICE: &str = "RESILIENT_RPC_SERVICE";
/// Environment variable overriding the required tags (comma-separated).
pub const ENV_TAGS: &str = "RESILIENT_RPC_TAGS";
/// Environment variable overriding the retry attempt cap.
pub const ENV_MAX_ATTEMPTS: &str = "RESILIENT_RPC_MAX_ATTEMPTS";

/// Construction parameters of one resilient pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Operation name used for the limiter, the breaker, logs and metrics.
    pub operation_name: String,
    /// Service to discover.
    pub service_name: String,
    /// Tags every discovered instance must carry.
    pub tags: Vec<String>,
    /// Only use instances that pass their health checks.
    pub passing_only: bool,
    /// Attempt cap per call, the first attempt included.
    pub max_retry_attempts: u32,
    /// Time budget for all attempts of one call.
    #[serde(rename = "retry_deadline_ms", with = "duration_ms")]
    pub retry_deadline: Duration,
    /// Consecutive failures that open the breaker.
    pub breaker_failure_threshold: u32,
    /// Time the breaker stays open before a trial call.
    #[serde(rename = "breaker_open_timeout_ms", with = "duration_ms")]
    pub breaker_open_timeout: Duration,
    /// Token bucket capacity.
    pub limiter_capacity: u32,
    /// Tokens added per second.
    pub limiter_refill_rate: f64,
    /// Bound of the discovery event queue.
    pub discovery_queue_capacity: usize,
    /// Release every endpoint when discovery fails.
    pub invalidate_on_error: bool,
    /// Load balancing strategy.
    pub balancer: BalancerStrategy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            operation_name: "call".to_string(),
            service_name: "default".to_string(),
            tags: Vec::new(),
            passing_only: true,
            max_retry_attempts: 3,
            retry_deadline: Duration::from_millis(500),
            breaker_failure_threshold: 5,
            breaker_open_timeout: Duration::from_secs(5),
            limiter_capacity: 100,
            limiter_refill_rate: 100.0,
            discovery_queue_capacity: 16,
            invalidate_on_error: false,
            balancer: BalancerStrategy::RoundRobin,
        }
    }
}

impl PipelineConfig {
    /// Defaults for `operation` on `service`.
    #[must_use]
    pub fn new(operation: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            operation_name: operation.into(),
            service_name: service.into(),
            ..Self::default()
        }
    }

    /// Set the required tags.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the attempt cap.
    #[must_use]
    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Set the retry deadline.
    #[must_use]
    pub fn with_retry_deadline(mut self, deadline: Duration) -> Self {
        self.retry_deadline = deadline;
        self
    }

    /// Set the breaker threshold and open timeout.
    #[must_use]
    pub fn with_breaker(mut self, failure_threshold: u32, open_timeout: Duration) -> Self {
        self.breaker_failure_threshold = failure_threshold;
        self.breaker_open_timeout = open_timeout;
        self
    }

    /// Set the token bucket capacity and refill rate.
    #[must_use]
    pub fn with_limiter(mut self, capacity: u32, refill_rate: f64) -> Self {
        self.limiter_capacity = capacity;
        self.limiter_refill_rate = refill_rate;
        self
    }

    /// Set the load balancing strategy.
    #[must_use]
    pub fn with_balancer(mut self, balancer: BalancerStrategy) -> Self {
        self.balancer = balancer;
        self
    }

    /// Release every endpoint when discovery fails.
    #[must_use]
    pub fn with_invalidate_on_error(mut self, invalidate: bool) -> Self {
        self.invalidate_on_error = invalidate;
        self
    }

    /// Load configuration from the path given by [`config_path`](Self::config_path),
    /// apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// result is invalid.
    #[allow(clippy::result_large_err)]
    pub fn load_default() -> Result<Self> {
        let mut config = Self::load_from_path(Self::config_path()?)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The file is malformed YAML
    #[allow(clippy::result_large_err)]
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed
    #[allow(clippy::result_large_err)]
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| PipelineError::Config(format!("Failed to parse config YAML: {}", e)))
    }

    /// Get the default config file path (`<config dir>/resilient-rpc/config.yaml`)
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined
    #[allow(clippy::result_large_err)]
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            PipelineError::Config("Could not determine config directory".to_string())
        })?;

        Ok(dir.join("resilient-rpc").join("config.yaml"))
    }

    /// Get the path to the config file, respecting `RESILIENT_RPC_CONFIG`
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined when
    /// `RESILIENT_RPC_CONFIG` is not set
    #[allow(clippy::result_large_err)]
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(env_path) = std::env::var(ENV_CONFIG) {
            Ok(PathBuf::from(env_path))
        } else {
            Self::default_path()
        }
    }

    /// Apply `RESILIENT_RPC_SERVICE`, `RESILIENT_RPC_TAGS` and
    /// `RESILIENT_RPC_MAX_ATTEMPTS` overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides read through `lookup`. Unparseable attempt counts are
    /// ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(service) = lookup(ENV_SERVICE) {
            self.service_name = service;
        }
        if let Some(tags) = lookup(ENV_TAGS) {
            self.tags = tags
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(attempts) = lookup(ENV_MAX_ATTEMPTS).and_then(|v| v.trim().parse().ok()) {
            self.max_retry_attempts = attempts;
        }
    }

    /// Check that every parameter is usable.
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the first invalid parameter.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(PipelineError::Config(msg.to_string()));
        if self.operation_name.trim().is_empty() {
            return invalid("operation_name must not be empty");
        }
        if self.service_name.trim().is_empty() {
            return invalid("service_name must not be empty");
        }
        if self.max_retry_attempts == 0 {
            return invalid("max_retry_attempts must be at least 1");
        }
        if self.breaker_failure_threshold == 0 {
            return invalid("breaker_failure_threshold must be at least 1");
        }
        if self.limiter_capacity == 0 {
            return invalid("limiter_capacity must be at least 1");
        }
        if self.limiter_refill_rate.is_nan() || self.limiter_refill_rate <= 0.0 {
            return invalid("limiter_refill_rate must be positive");
        }
        if self.discovery_queue_capacity == 0 {
            return invalid("discovery_queue_capacity must be at least 1");
        }
        Ok(())
    }

    /// The token bucket settings.
    #[must_use]
    pub fn limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::new()
            .with_capacity(self.limiter_capacity)
            .with_refill_rate(self.limiter_refill_rate)
    }

    /// The circuit breaker settings.
    #[must_use]
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.breaker_failure_threshold)
            .with_open_timeout(self.breaker_open_timeout)
    }

    /// The retry budget with the default policy and no backoff.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::builder()
            .max_attempts(self.max_retry_attempts)
            .deadline(self.retry_deadline)
            .build()
    }

    /// The discovery query.
    #[must_use]
    pub fn service_query(&self) -> ServiceQuery {
        ServiceQuery::new(self.service_name.clone())
            .with_tags(self.tags.clone())
            .with_passing_only(self.passing_only)
    }

    /// The Endpointer settings.
    #[must_use]
    pub fn endpointer_config(&self) -> EndpointerConfig {
        EndpointerConfig::new(self.service_name.clone())
            .with_invalidate_on_error(self.invalidate_on_error)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE_CONFIG: &str = r#"
operation_name: GetProduct
service_name: products
tags:
  - v2
  - eu
max_retry_attempts: 4
retry_deadline_ms: 250
breaker_failure_threshold: 2
breaker_open_timeout_ms: 1500
limiter_capacity: 10
limiter_refill_rate: 2.5
balancer: random
"#;

    #[test]
    fn test_parse_full_config() {
        let config = PipelineConfig::from_yaml(SAMPLE_CONFIG).unwrap();

        assert_eq!(config.operation_name, "GetProduct");
        assert_eq!(config.service_name, "products");
        assert_eq!(config.tags, vec!["v2", "eu"]);
        assert_eq!(config.max_retry_attempts, 4);
        assert_eq!(config.retry_deadline, Duration::from_millis(250));
        assert_eq!(config.breaker_failure_threshold, 2);
        assert_eq!(config.breaker_open_timeout, Duration::from_millis(1500));
        assert_eq!(config.limiter_capacity, 10);
        assert_eq!(config.limiter_refill_rate, 2.5);
        assert_eq!(config.balancer, BalancerStrategy::Random);
        // Unset keys keep their defaults.
        assert!(config.passing_only);
        assert_eq!(config.discovery_queue_capacity, 16);
    }

    #[test]
    fn test_minimal_config() {
        let config = PipelineConfig::from_yaml("service_name: users\n").unwrap();

        assert_eq!(config.service_name, "users");
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.retry_deadline, Duration::from_millis(500));
        assert_eq!(config.breaker_open_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_yaml() {
        let err = PipelineConfig::from_yaml("max_retry_attempts: [").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE_CONFIG.as_bytes()).unwrap();

        let config = PipelineConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.operation_name, "GetProduct");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineConfig::load_from_path(dir.path().join("missing.yaml")).unwrap_err();

        assert!(err.to_string().contains("missing.yaml"));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_SERVICE, "orders"),
            (ENV_TAGS, "blue, canary,,"),
            (ENV_MAX_ATTEMPTS, "7"),
        ]
        .into_iter()
        .collect();
        let mut config = PipelineConfig::new("GetOrder", "products");

        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.service_name, "orders");
        assert_eq!(config.tags, vec!["blue", "canary"]);
        assert_eq!(config.max_retry_attempts, 7);
    }

    #[test]
    fn test_unparseable_attempts_ignored() {
        let mut config = PipelineConfig::default();
        config.apply_overrides(|key| (key == ENV_MAX_ATTEMPTS).then(|| "many".to_string()));
        assert_eq!(config.max_retry_attempts, 3);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let cases = [
            PipelineConfig::default().with_max_retry_attempts(0),
            PipelineConfig::default().with_breaker(0, Duration::from_secs(1)),
            PipelineConfig::default().with_limiter(0, 1.0),
            PipelineConfig::default().with_limiter(1, 0.0),
            PipelineConfig::new("", "products"),
            PipelineConfig::new("GetProduct", " "),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(PipelineError::Config(_))),
                "accepted {config:?}"
            );
        }
    }

    #[test]
    fn test_derived_configs() {
        let config = PipelineConfig::from_yaml(SAMPLE_CONFIG).unwrap();

        assert_eq!(config.retry_config().max_attempts, 4);
        assert_eq!(config.retry_config().deadline, Duration::from_millis(250));
        assert_eq!(config.breaker_config().failure_threshold, 2);
        assert_eq!(config.limiter_config().capacity, 10);
        let query = config.service_query();
        assert_eq!(query.service, "products");
        assert_eq!(query.tags, vec!["v2", "eu"]);
        assert!(config.endpointer_config().service == "products");
    }

    #[test]
    fn test_yaml_roundtrip_uses_millis() {
        let yaml = serde_yaml::to_string(&PipelineConfig::default()).unwrap();
        assert!(yaml.contains("retry_deadline_ms: 500"));
        assert!(yaml.contains("balancer: round_robin"));
    }
}
