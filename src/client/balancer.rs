// SPDX-License-Identifier: MIT OR Apache-2.0

//! Load balancers over the live endpoint set.
//!
//! A balancer reads the current [`Endpointer`] snapshot on every call and
//! never blocks on updates. An empty set yields `NoEndpointsAvailable`.

use crate::client::endpointer::Endpointer;
use crate::endpoint::BoxEndpoint;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Picks the endpoint for the next attempt.
pub trait Balancer<Req, Resp>: Send + Sync {
    /// Select one live endpoint.
    ///
    /// # Errors
    ///
    /// Returns `NoEndpointsAvailable` when the live set is empty.
    fn select(&self) -> Result<BoxEndpoint<Req, Resp>>;
}

impl<Req, Resp, B: Balancer<Req, Resp> + ?Sized> Balancer<Req, Resp> for Box<B> {
    fn select(&self) -> Result<BoxEndpoint<Req, Resp>> {
        (**self).select()
    }
}

impl<Req, Resp, B: Balancer<Req, Resp> + ?Sized> Balancer<Req, Resp> for Arc<B> {
    fn select(&self) -> Result<BoxEndpoint<Req, Resp>> {
        (**self).select()
    }
}

/// Cycles through the live set in instance order.
pub struct RoundRobin<Req, Resp> {
    endpointer: Arc<Endpointer<Req, Resp>>,
    cursor: AtomicUsize,
}

impl<Req, Resp> RoundRobin<Req, Resp> {
    /// Balance over `endpointer`, starting at its first entry.
    pub fn new(endpointer: Arc<Endpointer<Req, Resp>>) -> Self {
        Self {
            endpointer,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl<Req, Resp> Balancer<Req, Resp> for RoundRobin<Req, Resp>
where
    Req: Send + 'static,
    Resp: 'static,
{
    fn select(&self) -> Result<BoxEndpoint<Req, Resp>> {
        let endpoints = self.endpointer.endpoints();
        if endpoints.is_empty() {
            return Err(self.endpointer.no_endpoints());
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(endpoints[n % endpoints.len()].endpoint.clone())
    }
}

/// Picks a uniformly random live endpoint.
pub struct RandomBalancer<Req, Resp> {
    endpointer: Arc<Endpointer<Req, Resp>>,
}

impl<Req, Resp> RandomBalancer<Req, Resp> {
    /// Balance over `endpointer`.
    pub fn new(endpointer: Arc<Endpointer<Req, Resp>>) -> Self {
        Self { endpointer }
    }
}

impl<Req, Resp> Balancer<Req, Resp> for RandomBalancer<Req, Resp>
where
    Req: Send + 'static,
    Resp: 'static,
{
    fn select(&self) -> Result<BoxEndpoint<Req, Resp>> {
        let endpoints = self.endpointer.endpoints();
        if endpoints.is_empty() {
            return Err(self.endpointer.no_endpoints());
        }
        let n = rand::random_range(0..endpoints.len());
        Ok(endpoints[n].endpoint.clone())
    }
}

/// Balancing strategy selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerStrategy {
    /// [`RoundRobin`].
    #[default]
    RoundRobin,
    /// [`RandomBalancer`].
    Random,
}

impl BalancerStrategy {
    /// Build the balancer over `endpointer`.
    pub fn build<Req, Resp>(
        self,
        endpointer: Arc<Endpointer<Req, Resp>>,
    ) -> Box<dyn Balancer<Req, Resp>>
    where
        Req: Send + 'static,
        Resp: 'static,
    {
        match self {
            Self::RoundRobin => Box::new(RoundRobin::new(endpointer)),
            Self::Random => Box::new(RandomBalancer::new(endpointer)),
        }
    }
}
