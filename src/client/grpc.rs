// SPDX-License-Identifier: MIT OR Apache-2.0

//! gRPC transport: a [`Factory`] that dials instances with tonic.
//!
//! Each instance gets its own [`Channel`]. The channel lives in a
//! [`ChannelHandle`] which doubles as the instance's [`Closer`]; once closed,
//! calls through the endpoint fail with a transport error instead of
//! reopening the connection.
//!
//! # Example
//!
//! ```no_run
//! use resilient_rpc::client::grpc::{GrpcFactory, GrpcTransportConfig, TlsConfig};
//! use std::time::Duration;
//!
//! # #[derive(Clone, PartialEq, prost::Message)]
//! # struct GetProductsRequest {}
//! # #[derive(Clone, PartialEq, prost::Message)]
//! # struct GetProductsResponse {}
//! # fn example() -> resilient_rpc::error::Result<()> {
//! let factory = GrpcFactory::<GetProductsRequest, GetProductsResponse>::new(
//!     "/products.ProductService/GetProducts",
//!     GrpcTransportConfig::new()
//!         .with_connect_timeout(Duration::from_secs(2))
//!         .with_tls(TlsConfig::new().with_ca_path("/etc/products/ca.crt")),
//! )?;
//! # Ok(())
//! # }
//! ```

use crate::client::discovery::Instance;
use crate::client::factory::{Built, Closer, Factory};
use crate::endpoint::{BoxEndpoint, CallContext, Endpoint};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use http::uri::PathAndQuery;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint as TonicEndpoint, Identity};
use tracing::debug;

/// TLS settings for dialing instances.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM file with the CA that signed instance certificates.
    pub ca_path: Option<String>,
    /// PEM client certificate for mutual TLS.
    pub crt_path: Option<String>,
    /// PEM client key for mutual TLS.
    pub key_path: Option<String>,
    /// Server name to verify instead of the instance host.
    pub domain_name: Option<String>,
    /// Also trust the bundled webpki roots.
    pub webpki_roots: bool,
}

impl TlsConfig {
    /// TLS with system defaults and no client certificate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust the CA in `path`.
    #[must_use]
    pub fn with_ca_path(mut self, path: impl Into<String>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    /// Present the client certificate and key in these files.
    #[must_use]
    pub fn with_client_cert(mut self, crt_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.crt_path = Some(crt_path.into());
        self.key_path = Some(key_path.into());
        self
    }

    /// Verify the server certificate against `name`.
    #[must_use]
    pub fn with_domain_name(mut self, name: impl Into<String>) -> Self {
        self.domain_name = Some(name.into());
        self
    }

    /// Trust the bundled webpki roots.
    #[must_use]
    pub fn with_webpki_roots(mut self, enabled: bool) -> Self {
        self.webpki_roots = enabled;
        self
    }

    fn load(&self) -> Result<ClientTlsConfig> {
        let mut tls = ClientTlsConfig::new();
        if let Some(path) = &self.ca_path {
            tls = tls.ca_certificate(Certificate::from_pem(read_pem(path)?));
        }
        match (&self.crt_path, &self.key_path) {
            (Some(crt), Some(key)) => {
                tls = tls.identity(Identity::from_pem(read_pem(crt)?, read_pem(key)?));
            }
            (None, None) => {}
            _ => {
                return Err(PipelineError::Config(
                    "client certificate and key must be set together".to_string(),
                ))
            }
        }
        if let Some(name) = &self.domain_name {
            tls = tls.domain_name(name.clone());
        }
        if self.webpki_roots {
            tls = tls.with_webpki_roots();
        }
        Ok(tls)
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| PipelineError::Config(format!("failed to read {path}: {e}")))
}

/// How instances are dialed.
#[derive(Debug, Clone)]
pub struct GrpcTransportConfig {
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,
    /// TCP and HTTP/2 keepalive interval.
    pub keepalive_interval: Option<Duration>,
    /// Connect on first call instead of at build time.
    pub lazy: bool,
    /// TLS settings; plain HTTP/2 when unset.
    pub tls: Option<TlsConfig>,
}

impl Default for GrpcTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: None,
            lazy: true,
            tls: None,
        }
    }
}

impl GrpcTransportConfig {
    /// Plain HTTP/2 with a 5 second connect timeout, connecting on first call.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the keepalive interval.
    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Connect on first call (`true`) or fail the build when the instance
    /// is unreachable (`false`).
    #[must_use]
    pub fn with_lazy_connect(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Dial over TLS.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    fn uri_for(&self, address: &str) -> Result<String> {
        let uri = if address.contains("://") {
            address.to_string()
        } else if self.tls.is_some() {
            format!("https://{address}")
        } else {
            format!("http://{address}")
        };
        let parsed = url::Url::parse(&uri).map_err(|e| PipelineError::Construction {
            instance: address.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.host_str().is_none() {
            return Err(PipelineError::Construction {
                instance: address.to_string(),
                reason: "address has no host".to_string(),
            });
        }
        Ok(uri)
    }
}

/// The channel to one instance; releasing it is the instance's close action.
#[derive(Debug)]
pub struct ChannelHandle {
    address: String,
    channel: Mutex<Option<Channel>>,
}

impl ChannelHandle {
    fn new(address: String, channel: Channel) -> Self {
        Self {
            address,
            channel: Mutex::new(Some(channel)),
        }
    }

    /// The instance address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns `true` once the channel was released.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.channel.lock().expect("lock poisoned").is_none()
    }

    fn channel(&self) -> Result<Channel> {
        self.channel
            .lock()
            .expect("lock poisoned")
            .clone()
            .ok_or_else(|| PipelineError::Transport(format!("channel to {} released", self.address)))
    }
}

impl Closer for ChannelHandle {
    fn close(&self) -> Result<()> {
        let released = self.channel.lock().expect("lock poisoned").take();
        if released.is_some() {
            debug!(target: "resilient_rpc::grpc", address = %self.address, "channel released");
        }
        Ok(())
    }
}

/// One unary gRPC method on one instance.
pub struct GrpcEndpoint<Req, Resp> {
    handle: Arc<ChannelHandle>,
    path: PathAndQuery,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> GrpcEndpoint<Req, Resp> {
    /// Call `path` over `handle`'s channel.
    #[must_use]
    pub fn new(handle: Arc<ChannelHandle>, path: PathAndQuery) -> Self {
        Self {
            handle,
            path,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<Req, Resp> Endpoint<Req, Resp> for GrpcEndpoint<Req, Resp>
where
    Req: prost::Message + Send + Sync + 'static,
    Resp: prost::Message + Default + Send + Sync + 'static,
{
    async fn call(&self, ctx: &CallContext, request: Req) -> Result<Resp> {
        let channel = self.handle.channel()?;
        let mut request = tonic::Request::new(request);
        if let Some(remaining) = ctx.remaining() {
            request.set_timeout(remaining);
        }
        for (key, value) in ctx.metadata() {
            match (
                AsciiMetadataKey::from_bytes(key.to_ascii_lowercase().as_bytes()),
                value.parse::<AsciiMetadataValue>(),
            ) {
                (Ok(key), Ok(value)) => {
                    request.metadata_mut().insert(key, value);
                }
                _ => debug!(target: "resilient_rpc::grpc", key = %key, "skipping metadata entry not valid as gRPC metadata"),
            }
        }

        let path = self.path.clone();
        let response = ctx
            .run(async move {
                let mut grpc = tonic::client::Grpc::new(channel);
                grpc.ready()
                    .await
                    .map_err(|e| PipelineError::Transport(e.to_string()))?;
                let codec = tonic_prost::ProstCodec::<Req, Resp>::default();
                grpc.unary(request, path, codec)
                    .await
                    .map_err(PipelineError::from_status)
            })
            .await?;
        Ok(response.into_inner())
    }
}

/// Dials instances with tonic and exposes one unary method on each.
pub struct GrpcFactory<Req, Resp> {
    path: PathAndQuery,
    transport: GrpcTransportConfig,
    tls: Option<ClientTlsConfig>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> GrpcFactory<Req, Resp> {
    /// Call the method at `path` (e.g. `/products.ProductService/GetProducts`).
    ///
    /// # Errors
    ///
    /// Returns `Config` if the path is invalid or the TLS files cannot be read.
    pub fn new(path: &str, transport: GrpcTransportConfig) -> Result<Self> {
        let path = PathAndQuery::try_from(path.to_string())
            .map_err(|e| PipelineError::Config(format!("invalid method path {path:?}: {e}")))?;
        let tls = transport.tls.as_ref().map(TlsConfig::load).transpose()?;
        Ok(Self {
            path,
            transport,
            tls,
            _marker: PhantomData,
        })
    }

    /// The transport settings.
    #[must_use]
    pub fn transport(&self) -> &GrpcTransportConfig {
        &self.transport
    }

    fn endpoint_for(&self, instance: &Instance) -> Result<TonicEndpoint> {
        let construction = |reason: String| PipelineError::Construction {
            instance: instance.address.clone(),
            reason,
        };
        let uri = self.transport.uri_for(&instance.address)?;
        let mut endpoint = TonicEndpoint::from_shared(uri)
            .map_err(|e| construction(e.to_string()))?
            .connect_timeout(self.transport.connect_timeout);
        if let Some(interval) = self.transport.keepalive_interval {
            endpoint = endpoint
                .tcp_keepalive(Some(interval))
                .http2_keep_alive_interval(interval);
        }
        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|e| construction(e.to_string()))?;
        }
        Ok(endpoint)
    }
}

#[async_trait]
impl<Req, Resp> Factory<Req, Resp> for GrpcFactory<Req, Resp>
where
    Req: prost::Message + Send + Sync + 'static,
    Resp: prost::Message + Default + Send + Sync + 'static,
{
    async fn build(&self, instance: &Instance) -> Result<Built<Req, Resp>> {
        let endpoint = self.endpoint_for(instance)?;
        let channel = if self.transport.lazy {
            endpoint.connect_lazy()
        } else {
            endpoint
                .connect()
                .await
                .map_err(|e| PipelineError::Construction {
                    instance: instance.address.clone(),
                    reason: e.to_string(),
                })?
        };

        let handle = Arc::new(ChannelHandle::new(instance.address.clone(), channel));
        let endpoint: BoxEndpoint<Req, Resp> =
            Arc::new(GrpcEndpoint::new(handle.clone(), self.path.clone()));
        let closer: Box<dyn Closer> = Box::new(handle);
        Ok((endpoint, closer))
    }
}
