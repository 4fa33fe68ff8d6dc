// SPDX-License-Identifier: MIT OR Apache-2.0

//! Service discovery: instances, backends and the [`Instancer`] watch task.
//!
//! A [`DiscoveryBackend`] answers blocking queries in the style of a Consul
//! health endpoint: each `watch` call returns the service's current
//! membership once it differs from the index the caller last saw. The
//! [`Instancer`] runs that loop on a background task and publishes full
//! membership snapshots through a bounded channel.
//!
//! # Example
//!
//! ```
//! use resilient_rpc::client::discovery::{Instance, Instancer, ServiceQuery, StaticDiscovery};
//! use std::sync::Arc;
//!
//! # async fn example() -> resilient_rpc::error::Result<()> {
//! let backend = StaticDiscovery::new(vec![
//!     Instance::new("10.0.0.1:8080"),
//!     Instance::new("10.0.0.2:8080"),
//! ]);
//! let mut instancer = Instancer::spawn(Arc::new(backend), ServiceQuery::new("products"), 16);
//!
//! let snapshot = instancer.next().await.expect("watch running")?;
//! assert_eq!(snapshot.len(), 2);
//! # Ok(())
//! # }
//! ```

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// A dial-able service instance as reported by discovery.
///
/// Instances are compared by value: a changed tag set or health status makes
/// a different instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Instance {
    /// `host:port` or a full URL.
    pub address: String,
    /// Discovery tags.
    pub tags: Vec<String>,
    /// Whether every health check passes.
    pub healthy: bool,
}

impl Instance {
    /// A healthy, untagged instance.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tags: Vec::new(),
            healthy: true,
        }
    }

    /// Set the discovery tags.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the health status.
    #[must_use]
    pub fn with_health(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    /// Returns `true` if the instance carries every tag in `required`.
    #[must_use]
    pub fn has_tags(&self, required: &[String]) -> bool {
        required.iter().all(|t| self.tags.contains(t))
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// What to watch: a service name, required tags and a health filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceQuery {
    /// Logical service name.
    pub service: String,
    /// Tags every instance must carry.
    pub tags: Vec<String>,
    /// Only report instances whose health checks pass.
    pub passing_only: bool,
}

impl ServiceQuery {
    /// Watch every passing instance of `service`.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            tags: Vec::new(),
            passing_only: true,
        }
    }

    /// Require these tags.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable the health filter.
    #[must_use]
    pub fn with_passing_only(mut self, passing_only: bool) -> Self {
        self.passing_only = passing_only;
        self
    }

    /// Returns `true` if `instance` satisfies the tag and health filters.
    #[must_use]
    pub fn matches(&self, instance: &Instance) -> bool {
        (!self.passing_only || instance.healthy) && instance.has_tags(&self.tags)
    }
}

/// Result of one blocking query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSnapshot {
    /// Backend index; passed back to the next `watch` call.
    pub index: u64,
    /// Current membership, unfiltered.
    pub instances: Vec<Instance>,
}

/// A service-discovery backend.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync + 'static {
    /// Return the membership of `query.service`.
    ///
    /// With `last_index == None` the call returns immediately. Otherwise it
    /// blocks until the backend index moves past `last_index`.
    ///
    /// # Errors
    ///
    /// Any error is terminal for the watch that issued it.
    async fn watch(&self, query: &ServiceQuery, last_index: Option<u64>)
        -> Result<ServiceSnapshot>;
}

/// A fixed instance list, for talking to known addresses without a registry.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    instances: Vec<Instance>,
}

impl StaticDiscovery {
    /// Serve `instances` forever.
    #[must_use]
    pub fn new(instances: Vec<Instance>) -> Self {
        Self { instances }
    }

    /// Serve healthy, untagged instances at `addresses`.
    #[must_use]
    pub fn from_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(addresses.into_iter().map(Instance::new).collect())
    }
}

#[async_trait]
impl DiscoveryBackend for StaticDiscovery {
    async fn watch(
        &self,
        _query: &ServiceQuery,
        last_index: Option<u64>,
    ) -> Result<ServiceSnapshot> {
        if last_index.is_some() {
            // Membership never changes.
            std::future::pending::<()>().await;
        }
        Ok(ServiceSnapshot {
            index: 1,
            instances: self.instances.clone(),
        })
    }
}

/// One Instancer notification: the full filtered membership, sorted, or the
/// terminal error that ended the watch.
pub type InstanceEvent = Result<Vec<Instance>>;

/// Background watch over one service, publishing membership snapshots.
///
/// Snapshots are only sent when the filtered set changes. The queue is
/// bounded: when the consumer falls behind, the watch task waits. Dropping
/// the Instancer stops the task.
#[derive(Debug)]
pub struct Instancer {
    events: mpsc::Receiver<InstanceEvent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Instancer {
    /// Start watching `query` on `backend`, queueing at most `capacity`
    /// undelivered snapshots.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn spawn(
        backend: Arc<dyn DiscoveryBackend>,
        query: ServiceQuery,
        capacity: usize,
    ) -> Self {
        let (tx, events) = mpsc::channel(capacity.max(1));
        let (shutdown, stop) = watch::channel(false);
        let task = tokio::spawn(run_watch(backend, query, tx, stop));
        Self {
            events,
            shutdown,
            task,
        }
    }

    /// Wait for the next snapshot. `None` once the watch has ended and every
    /// queued event was delivered.
    pub async fn next(&mut self) -> Option<InstanceEvent> {
        self.events.recv().await
    }

    /// Stop the watch task. Already queued events stay readable.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Returns `true` once the watch task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Instancer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_watch(
    backend: Arc<dyn DiscoveryBackend>,
    query: ServiceQuery,
    tx: mpsc::Sender<InstanceEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut last_index = None;
    let mut last_set: Option<Vec<Instance>> = None;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = stop.changed() => return,
            outcome = backend.watch(&query, last_index) => outcome,
        };

        let event = match outcome {
            Ok(snapshot) => {
                last_index = Some(snapshot.index);
                let mut instances: Vec<Instance> = snapshot
                    .instances
                    .into_iter()
                    .filter(|i| query.matches(i))
                    .collect();
                instances.sort();
                instances.dedup();
                if last_set.as_ref() == Some(&instances) {
                    continue;
                }
                debug!(
                    target: "resilient_rpc::discovery",
                    service = %query.service,
                    index = snapshot.index,
                    instances = instances.len(),
                    "membership changed"
                );
                last_set = Some(instances.clone());
                Ok(instances)
            }
            Err(e) => {
                error!(target: "resilient_rpc::discovery", service = %query.service, error = %e, "watch failed");
                Err(match e {
                    PipelineError::Discovery(_) => e,
                    other => PipelineError::Discovery(other.to_string()),
                })
            }
        };

        let terminal = event.is_err();
        tokio::select! {
            biased;
            _ = stop.changed() => return,
            sent = tx.send(event) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        if terminal {
            return;
        }
    }
}
