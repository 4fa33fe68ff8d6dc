// SPDX-License-Identifier: MIT OR Apache-2.0

//! The uniform call abstraction every pipeline layer implements.
//!
//! An [`Endpoint`] performs one remote operation: it takes a strongly-typed
//! request and returns the matching response or a [`PipelineError`]. Rate
//! limiting, circuit breaking, tracing and retries are all decorators that
//! hold the endpoint they wrap and implement the same trait.
//!
//! # Example
//!
//! ```
//! use resilient_rpc::endpoint::{endpoint_fn, CallContext, Endpoint};
//!
//! # async fn example() -> resilient_rpc::error::Result<()> {
//! let upper = endpoint_fn(|_ctx: CallContext, name: String| async move {
//!     Ok(name.to_uppercase())
//! });
//!
//! let reply = upper.call(&CallContext::background(), "ada".to_string()).await?;
//! assert_eq!(reply, "ADA");
//! # Ok(())
//! # }
//! ```

mod context;

pub use context::{CallContext, CancelHandle};

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// A single remote operation.
#[async_trait]
pub trait Endpoint<Req, Resp>: Send + Sync {
    /// Invoke the operation.
    ///
    /// Implementations must fail with [`PipelineError::Cancelled`] when `ctx`
    /// is done before or during the call.
    async fn call(&self, ctx: &CallContext, request: Req) -> Result<Resp>;
}

/// Shared, type-erased endpoint.
pub type BoxEndpoint<Req, Resp> = Arc<dyn Endpoint<Req, Resp>>;

#[async_trait]
impl<Req, Resp, E> Endpoint<Req, Resp> for Arc<E>
where
    Req: Send + 'static,
    E: Endpoint<Req, Resp> + ?Sized,
{
    async fn call(&self, ctx: &CallContext, request: Req) -> Result<Resp> {
        (**self).call(ctx, request).await
    }
}

/// Endpoint backed by an async closure.
pub struct FnEndpoint<F, Req, Resp> {
    f: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

/// Build an [`Endpoint`] from an async closure.
///
/// The closure receives an owned clone of the context. The call is run under
/// that context, so a cancelled or expired context resolves to `Cancelled`.
pub fn endpoint_fn<F, Fut, Req, Resp>(f: F) -> FnEndpoint<F, Req, Resp>
where
    F: Fn(CallContext, Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    FnEndpoint {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, Req, Resp> Endpoint<Req, Resp> for FnEndpoint<F, Req, Resp>
where
    F: Fn(CallContext, Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: &CallContext, request: Req) -> Result<Resp> {
        if ctx.is_done() {
            return Err(PipelineError::Cancelled);
        }
        ctx.run((self.f)(ctx.clone(), request)).await
    }
}
