// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration management for resilient pipelines
//!
//! # Environment Variables
//!
//! The following environment variables are supported:
//!
//! - `RESILIENT_RPC_CONFIG` - Path to the config file (default:
//!   `<config dir>/resilient-rpc/config.yaml`)
//! - `RESILIENT_RPC_SERVICE` - Override the service name
//! - `RESILIENT_RPC_TAGS` - Override the required tags (comma-separated)
//! - `RESILIENT_RPC_MAX_ATTEMPTS` - Override the retry attempt cap
//!
//! # Example
//!
//! ```no_run
//! use resilient_rpc::config::PipelineConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load with environment variable overrides
//! let config = PipelineConfig::load_default()?;
//! println!("Calling {} on {}", config.operation_name, config.service_name);
//! # Ok(())
//! # }
//! ```

mod pipeline;

pub use pipeline::{
    PipelineConfig, ENV_CONFIG, ENV_MAX_ATTEMPTS, ENV_SERVICE, ENV_TAGS,
};
