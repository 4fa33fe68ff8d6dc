// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process doubles for exercising pipelines without a registry or a
//! network.
//!
//! - [`InMemoryDiscovery`]: a registry whose membership tests change at will.
//! - [`MockFactory`]: builds endpoints that answer `"{address}:{request}"`,
//!   counting builds and releases per address.
//! - [`ScriptedEndpoint`]: plays back a fixed sequence of outcomes.
//! - [`CountingCloser`]: a closer that counts its invocations.

use crate::client::discovery::{DiscoveryBackend, Instance, ServiceQuery, ServiceSnapshot};
use crate::client::factory::{Built, Closer, Factory};
use crate::endpoint::{BoxEndpoint, CallContext, Endpoint};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Default)]
struct Registry {
    index: u64,
    instances: Vec<Instance>,
    error: Option<String>,
}

/// A watchable in-memory service registry.
///
/// Clones share the same registry.
#[derive(Debug, Clone)]
pub struct InMemoryDiscovery {
    state: Arc<watch::Sender<Registry>>,
}

impl Default for InMemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDiscovery {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(Registry {
            index: 1,
            ..Registry::default()
        });
        Self {
            state: Arc::new(state),
        }
    }

    /// Replace the membership and bump the index.
    pub fn set_instances(&self, instances: Vec<Instance>) {
        self.state.send_modify(|r| {
            r.index += 1;
            r.instances = instances;
        });
    }

    /// Make every pending and future watch fail with `message`.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.state.send_modify(|r| {
            r.index += 1;
            r.error = Some(message);
        });
    }

    /// The current index.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.state.borrow().index
    }
}

#[async_trait]
impl DiscoveryBackend for InMemoryDiscovery {
    async fn watch(
        &self,
        _query: &ServiceQuery,
        last_index: Option<u64>,
    ) -> Result<ServiceSnapshot> {
        let mut rx = self.state.subscribe();
        if let Some(last) = last_index {
            if rx.wait_for(|r| r.index > last).await.is_err() {
                return Err(PipelineError::Discovery("registry closed".to_string()));
            }
        }
        let registry = rx.borrow().clone();
        match registry.error {
            Some(message) => Err(PipelineError::Discovery(message)),
            None => Ok(ServiceSnapshot {
                index: registry.index,
                instances: registry.instances,
            }),
        }
    }
}

/// A [`Closer`] that counts how often it was called. Clones share the count.
#[derive(Debug, Clone, Default)]
pub struct CountingCloser {
    count: Arc<AtomicUsize>,
}

impl CountingCloser {
    /// A closer that was never called.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `close` calls so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Closer for CountingCloser {
    fn close(&self) -> Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum Step<Resp> {
    /// Reply with this value.
    Reply(Resp),
    /// Fail with a transport error.
    Transport,
    /// Fail with a remote status carrying this code.
    Status(tonic::Code),
    /// Sleep, then reply.
    Delay(Duration, Resp),
    /// Never complete.
    Hang,
}

/// An endpoint playing back a fixed sequence of outcomes. The last step
/// repeats once the script is exhausted.
#[derive(Debug)]
pub struct ScriptedEndpoint<Resp> {
    steps: Vec<Step<Resp>>,
    calls: AtomicUsize,
}

impl<Resp> ScriptedEndpoint<Resp> {
    /// Play back `steps`.
    #[must_use]
    pub fn new(steps: Vec<Step<Resp>>) -> Self {
        Self {
            steps,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always fail with a transport error.
    #[must_use]
    pub fn failing() -> Self {
        Self::new(vec![Step::Transport])
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<Req, Resp> Endpoint<Req, Resp> for ScriptedEndpoint<Resp>
where
    Req: Send + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    async fn call(&self, _ctx: &CallContext, _request: Req) -> Result<Resp> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .get(n)
            .or_else(|| self.steps.last())
            .cloned()
            .unwrap_or(Step::Transport);
        match step {
            Step::Reply(resp) => Ok(resp),
            Step::Transport => Err(PipelineError::Transport("connection reset".to_string())),
            Step::Status(code) => Err(PipelineError::Api(tonic::Status::new(code, "scripted"))),
            Step::Delay(delay, resp) => {
                tokio::time::sleep(delay).await;
                Ok(resp)
            }
            Step::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct FactoryState {
    builds: HashMap<String, usize>,
    calls: HashMap<String, usize>,
    pending_failures: HashMap<String, usize>,
    closers: HashMap<String, CountingCloser>,
    scripts: HashMap<String, Arc<ScriptedEndpoint<String>>>,
}

/// A [`Factory`] for `String` requests whose endpoints answer
/// `"{address}:{request}"` unless a script was installed for the address.
///
/// Clones share their counters.
#[derive(Clone, Default)]
pub struct MockFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MockFactory {
    /// A factory that builds every instance successfully.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FactoryState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Fail the next `n` builds for `address` with `Construction`.
    pub fn fail_builds_for(&self, address: &str, n: usize) {
        self.lock().pending_failures.insert(address.to_string(), n);
    }

    /// Answer calls to `address` from `steps` instead of echoing.
    pub fn script(&self, address: &str, steps: Vec<Step<String>>) {
        self.lock()
            .scripts
            .insert(address.to_string(), Arc::new(ScriptedEndpoint::new(steps)));
    }

    /// Successful and failed builds for `address`.
    #[must_use]
    pub fn builds(&self, address: &str) -> usize {
        self.lock().builds.get(address).copied().unwrap_or(0)
    }

    /// Releases of endpoints built for `address`.
    #[must_use]
    pub fn closes(&self, address: &str) -> usize {
        self.lock()
            .closers
            .get(address)
            .map_or(0, CountingCloser::count)
    }

    /// Calls that reached an endpoint built for `address`.
    #[must_use]
    pub fn calls(&self, address: &str) -> usize {
        self.lock().calls.get(address).copied().unwrap_or(0)
    }

    /// Calls that reached any endpoint.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }
}

#[async_trait]
impl Factory<String, String> for MockFactory {
    async fn build(&self, instance: &Instance) -> Result<Built<String, String>> {
        let address = instance.address.clone();
        let closer = {
            let mut state = self.lock();
            *state.builds.entry(address.clone()).or_default() += 1;
            if let Some(left) = state.pending_failures.get_mut(&address) {
                if *left > 0 {
                    *left -= 1;
                    return Err(PipelineError::Construction {
                        instance: address,
                        reason: "connection refused".to_string(),
                    });
                }
            }
            state.closers.entry(address.clone()).or_default().clone()
        };
        let endpoint: BoxEndpoint<String, String> = Arc::new(MockEndpoint {
            address,
            factory: self.clone(),
        });
        Ok((endpoint, Box::new(closer)))
    }
}

struct MockEndpoint {
    address: String,
    factory: MockFactory,
}

#[async_trait]
impl Endpoint<String, String> for MockEndpoint {
    async fn call(&self, ctx: &CallContext, request: String) -> Result<String> {
        let script = {
            let mut state = self.factory.lock();
            *state.calls.entry(self.address.clone()).or_default() += 1;
            state.scripts.get(&self.address).cloned()
        };
        match script {
            Some(script) => script.call(ctx, request).await,
            None => Ok(format!("{}:{}", self.address, request)),
        }
    }
}
