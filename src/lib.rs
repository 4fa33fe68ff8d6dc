// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client-side resilient RPC pipeline.
//!
//! Every call flows through bounded retries, a load balancer over the
//! instances found by service discovery, a per-operation token bucket, a
//! per-operation circuit breaker and a tracing span before it reaches the
//! transport. See [`client::ResilientClient`] for the assembled pipeline.

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod runtime;
pub mod testkit;

pub use client::{ResilientClient, ResilientClientBuilder};
pub use config::PipelineConfig;
pub use endpoint::{CallContext, Endpoint};
pub use error::{PipelineError, Result};
