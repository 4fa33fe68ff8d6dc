// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;
use thiserror::Error;

#[allow(clippy::result_large_err)]
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limit exceeded for {operation}")]
    RateLimited { operation: String },

    #[error("Circuit breaker is open for {operation}")]
    CircuitOpen {
        operation: String,
        retry_after: Option<Duration>,
    },

    #[error("No endpoints available for service {service}")]
    NoEndpointsAvailable { service: String },

    #[error("Retries exhausted after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<PipelineError>,
    },

    #[error("Call cancelled")]
    Cancelled,

    #[error("API request failed: {0}")]
    Api(#[from] tonic::Status),

    #[error("Failed to build endpoint for {instance}: {reason}")]
    Construction { instance: String, reason: String },

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Classify a gRPC status returned by a remote call.
    ///
    /// `Unavailable` means the instance could not be reached and is treated
    /// as a transport failure; every other status is the operation's own
    /// domain error and is kept intact.
    #[must_use]
    pub fn from_status(status: tonic::Status) -> Self {
        if status.code() == tonic::Code::Unavailable {
            PipelineError::Transport(status.message().to_string())
        } else {
            PipelineError::Api(status)
        }
    }

    /// Returns `true` for network/connection failures.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, PipelineError::Transport(_))
    }

    /// The innermost error, looking through `RetriesExhausted`.
    #[must_use]
    pub fn last_error(&self) -> &PipelineError {
        match self {
            PipelineError::RetriesExhausted { last, .. } => last.last_error(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_from_status_unavailable_is_transport() {
        let err = PipelineError::from_status(tonic::Status::unavailable("connection refused"));
        assert!(err.is_transport());
        assert_eq!(err.to_string(), "Transport error: connection refused");
    }

    #[test]
    fn test_from_status_keeps_domain_error() {
        let err = PipelineError::from_status(tonic::Status::not_found("no such product"));
        match err {
            PipelineError::Api(status) => assert_eq!(status.code(), tonic::Code::NotFound),
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn test_retries_exhausted_keeps_cause() {
        let err = PipelineError::RetriesExhausted {
            attempts: 3,
            last: Box::new(PipelineError::Transport("reset by peer".to_string())),
        };
        assert!(err.source().is_some());
        assert!(err.last_error().is_transport());
        assert!(err.to_string().contains("reset by peer"));
    }
}
