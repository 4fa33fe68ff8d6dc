// SPDX-License-Identifier: MIT OR Apache-2.0

//! The live endpoint set for one service.
//!
//! The [`Endpointer`] applies Instancer snapshots: it builds endpoints for
//! new instances through the [`Factory`], releases the resources of
//! instances that disappeared and publishes the result as one immutable
//! snapshot. Load balancers read that snapshot lock-free on every call.
//!
//! Updates are serialized by an async mutex that may be held across factory
//! calls. Readers never take it.
//!
//! Instances whose build failed are rebuilt from the last snapshot on a
//! doubling backoff, since discovery does not repeat an unchanged membership.

use crate::client::discovery::{Instance, InstanceEvent, Instancer};
use crate::client::factory::{Closer, Factory};
use crate::endpoint::BoxEndpoint;
use crate::error::PipelineError;
use crate::runtime::MetricsCollector;
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Settings for an [`Endpointer`].
#[derive(Debug, Clone)]
pub struct EndpointerConfig {
    /// Service name, used in errors, logs and metrics.
    pub service: String,
    /// Release every endpoint when discovery fails instead of keeping the
    /// last known set.
    pub invalidate_on_error: bool,
    /// First delay before rebuilding instances whose build failed.
    pub rebuild_backoff: Duration,
    /// Upper bound for the doubling rebuild delay.
    pub max_rebuild_backoff: Duration,
}

impl EndpointerConfig {
    /// Keep the last known set on discovery errors.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            invalidate_on_error: false,
            rebuild_backoff: Duration::from_millis(250),
            max_rebuild_backoff: Duration::from_secs(30),
        }
    }

    /// Release every endpoint when discovery fails.
    #[must_use]
    pub fn with_invalidate_on_error(mut self, invalidate: bool) -> Self {
        self.invalidate_on_error = invalidate;
        self
    }

    /// Set the rebuild delay range for failed builds.
    #[must_use]
    pub fn with_rebuild_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.rebuild_backoff = initial;
        self.max_rebuild_backoff = max.max(initial);
        self
    }
}

/// One callable entry of the published set.
pub struct LiveEndpoint<Req, Resp> {
    /// The instance the endpoint talks to.
    pub instance: Instance,
    /// The fully layered endpoint.
    pub endpoint: BoxEndpoint<Req, Resp>,
}

impl<Req, Resp> Clone for LiveEndpoint<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

struct Entry<Req, Resp> {
    endpoint: BoxEndpoint<Req, Resp>,
    closer: Box<dyn Closer>,
}

/// Maintains the live endpoint set derived from discovery.
pub struct Endpointer<Req, Resp> {
    config: EndpointerConfig,
    factory: Arc<dyn Factory<Req, Resp>>,
    entries: Mutex<BTreeMap<Instance, Entry<Req, Resp>>>,
    live: ArcSwap<Vec<LiveEndpoint<Req, Resp>>>,
    // Last snapshot with at least one failed build. Written under `entries`.
    unbuilt: std::sync::Mutex<Option<Vec<Instance>>>,
    closed: AtomicBool,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<Req, Resp> Endpointer<Req, Resp> {
    /// An empty set that builds endpoints with `factory`.
    pub fn new(config: EndpointerConfig, factory: Arc<dyn Factory<Req, Resp>>) -> Self {
        Self {
            config,
            factory,
            entries: Mutex::new(BTreeMap::new()),
            live: ArcSwap::from_pointee(Vec::new()),
            unbuilt: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            metrics: None,
        }
    }

    /// Report the live set size to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The service this set belongs to.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.config.service
    }

    /// The current snapshot, sorted by instance.
    #[must_use]
    pub fn endpoints(&self) -> Arc<Vec<LiveEndpoint<Req, Resp>>> {
        self.live.load_full()
    }

    /// Number of live endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.load().len()
    }

    /// Returns `true` if no endpoint is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The instances currently live, sorted.
    #[must_use]
    pub fn instances(&self) -> Vec<Instance> {
        self.live.load().iter().map(|e| e.instance.clone()).collect()
    }

    /// Returns `true` once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` while an instance of the last snapshot has no endpoint
    /// because its build failed.
    #[must_use]
    pub fn has_failed_builds(&self) -> bool {
        self.unbuilt.lock().expect("lock poisoned").is_some()
    }

    /// Release every endpoint and stop accepting updates.
    pub async fn close(&self) {
        let mut entries = self.entries.lock().await;
        self.closed.store(true, Ordering::Release);
        *self.unbuilt.lock().expect("lock poisoned") = None;
        let removed = std::mem::take(&mut *entries);
        self.publish(&entries);
        drop(entries);
        self.release(removed);
    }

    fn publish(&self, entries: &BTreeMap<Instance, Entry<Req, Resp>>) {
        let live: Vec<LiveEndpoint<Req, Resp>> = entries
            .iter()
            .map(|(instance, entry)| LiveEndpoint {
                instance: instance.clone(),
                endpoint: entry.endpoint.clone(),
            })
            .collect();
        if let Some(metrics) = &self.metrics {
            metrics.set_live_endpoints(&self.config.service, live.len());
        }
        self.live.store(Arc::new(live));
    }

    fn release(&self, removed: BTreeMap<Instance, Entry<Req, Resp>>) {
        for (instance, entry) in removed {
            info!(target: "resilient_rpc::endpointer", service = %self.config.service, instance = %instance, "endpoint removed");
            if let Err(e) = entry.closer.close() {
                warn!(target: "resilient_rpc::endpointer", service = %self.config.service, instance = %instance, error = %e, "failed to release endpoint");
            }
        }
    }

    /// `NoEndpointsAvailable` for this service.
    pub(crate) fn no_endpoints(&self) -> PipelineError {
        PipelineError::NoEndpointsAvailable {
            service: self.config.service.clone(),
        }
    }
}

impl<Req, Resp> Endpointer<Req, Resp>
where
    Req: Send + 'static,
    Resp: 'static,
{
    /// Apply one Instancer event.
    ///
    /// Endpoints for new instances are built first; then the new set is
    /// published; only then are removed instances released, so a fresh
    /// selection never returns a released endpoint.
    pub async fn update(&self, event: InstanceEvent) {
        let mut entries = self.entries.lock().await;
        if self.is_closed() {
            return;
        }

        let removed = match event {
            Ok(instances) => self.apply(&mut entries, instances).await,
            Err(e) => {
                error!(target: "resilient_rpc::endpointer", service = %self.config.service, error = %e, "discovery failed");
                if !self.config.invalidate_on_error {
                    return;
                }
                *self.unbuilt.lock().expect("lock poisoned") = None;
                std::mem::take(&mut *entries)
            }
        };

        self.publish(&entries);
        drop(entries);
        self.release(removed);
    }

    /// Re-apply the last snapshot to build the instances that failed.
    ///
    /// Returns `true` if some build still fails.
    pub async fn rebuild_failed(&self) -> bool {
        let mut entries = self.entries.lock().await;
        if self.is_closed() {
            return false;
        }
        let snapshot = self.unbuilt.lock().expect("lock poisoned").clone();
        let Some(instances) = snapshot else {
            return false;
        };
        let removed = self.apply(&mut entries, instances).await;
        self.publish(&entries);
        drop(entries);
        self.release(removed);
        self.has_failed_builds()
    }

    async fn apply(
        &self,
        entries: &mut BTreeMap<Instance, Entry<Req, Resp>>,
        instances: Vec<Instance>,
    ) -> BTreeMap<Instance, Entry<Req, Resp>> {
        let mut next = BTreeMap::new();
        let mut failed = false;
        for instance in &instances {
            if let Some(entry) = entries.remove(instance) {
                next.insert(instance.clone(), entry);
                continue;
            }
            if next.contains_key(instance) {
                continue;
            }
            match self.factory.build(instance).await {
                Ok((endpoint, closer)) => {
                    info!(target: "resilient_rpc::endpointer", service = %self.config.service, instance = %instance, "endpoint added");
                    next.insert(instance.clone(), Entry { endpoint, closer });
                }
                Err(e) => {
                    warn!(target: "resilient_rpc::endpointer", service = %self.config.service, instance = %instance, error = %e, "failed to build endpoint");
                    failed = true;
                }
            }
        }
        *self.unbuilt.lock().expect("lock poisoned") = failed.then_some(instances);
        std::mem::replace(entries, next)
    }

    /// Apply events from `instancer` on a background task until it ends or
    /// `stop` fires. Failed builds are retried between events, waiting
    /// twice as long after each attempt that still fails.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn follow(
        self: Arc<Self>,
        mut instancer: Instancer,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = self.config.rebuild_backoff;
            loop {
                let rebuild = self.has_failed_builds();
                let event = tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    event = instancer.next() => event,
                    () = tokio::time::sleep(backoff), if rebuild => {
                        backoff = if self.rebuild_failed().await {
                            (backoff * 2).min(self.config.max_rebuild_backoff)
                        } else {
                            self.config.rebuild_backoff
                        };
                        continue;
                    }
                };
                backoff = self.config.rebuild_backoff;
                match event {
                    Some(event) => self.update(event).await,
                    None => break,
                }
            }
            instancer.stop();
        })
    }
}

impl<Req, Resp> Drop for Endpointer<Req, Resp> {
    fn drop(&mut self) {
        for (instance, entry) in std::mem::take(self.entries.get_mut()) {
            if let Err(e) = entry.closer.close() {
                warn!(target: "resilient_rpc::endpointer", service = %self.config.service, instance = %instance, error = %e, "failed to release endpoint");
            }
        }
    }
}
