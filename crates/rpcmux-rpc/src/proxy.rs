//! Typed clients over a call-by-name target.
//!
//! A [`ProxyIdentifier<T>`] names a remote service (and the channel path it
//! is served on) and carries the client type `T` that wraps it:
//!
//! ```ignore
//! pub const COMMON_SERVER: ProxyIdentifier<CommonServerClient> =
//!     ProxyIdentifier::new("CommonServerPath");
//!
//! let client = peer.get_proxy(&COMMON_SERVER);
//! let os = client.get_backend_os().await?;
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use rpcmux_transport::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;
use crate::peer::RpcPeer;

/// Channel path services are served on unless an identifier says otherwise.
pub const DEFAULT_RPC_PATH: &str = "RPCService";

/// Anything that can carry a call by service id and method name.
pub trait CallTarget: Send + Sync + 'static {
    fn call(&self, service_id: &str, method: &str, args: Vec<Value>) -> BoxFuture<'static, Result<Value>>;
}

impl CallTarget for RpcPeer {
    fn call(&self, service_id: &str, method: &str, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        let peer = self.clone();
        let service_id = service_id.to_owned();
        let method = method.to_owned();
        Box::pin(async move { peer.call(&service_id, &method, args).await })
    }
}

/// Untyped client bound to one remote service.
#[derive(Clone)]
pub struct RemoteProxy {
    target: Arc<dyn CallTarget>,
    service_id: String,
}

impl RemoteProxy {
    pub fn new(target: Arc<dyn CallTarget>, service_id: impl Into<String>) -> Self {
        Self {
            target,
            service_id: service_id.into(),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.target.call(&self.service_id, method, args).await
    }

    /// Call and deserialize the result.
    pub async fn invoke<R: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<R> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("service_id", &self.service_id)
            .finish_non_exhaustive()
    }
}

/// Client types constructible from a [`RemoteProxy`].
pub trait FromProxy: Sized {
    fn from_proxy(proxy: RemoteProxy) -> Self;
}

impl FromProxy for RemoteProxy {
    fn from_proxy(proxy: RemoteProxy) -> Self {
        proxy
    }
}

/// Registration-time token binding a service id and channel path to the
/// client type `T`.
pub struct ProxyIdentifier<T> {
    service_id: &'static str,
    path: &'static str,
    _client: PhantomData<fn() -> T>,
}

impl<T> ProxyIdentifier<T> {
    pub const fn new(service_id: &'static str) -> Self {
        Self {
            service_id,
            path: DEFAULT_RPC_PATH,
            _client: PhantomData,
        }
    }

    pub const fn with_path(self, path: &'static str) -> Self {
        Self {
            service_id: self.service_id,
            path,
            _client: PhantomData,
        }
    }

    pub fn service_id(&self) -> &'static str {
        self.service_id
    }

    pub fn path(&self) -> &'static str {
        self.path
    }
}

impl<T> Clone for ProxyIdentifier<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ProxyIdentifier<T> {}

impl<T> fmt::Debug for ProxyIdentifier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyIdentifier")
            .field("service_id", &self.service_id)
            .field("path", &self.path)
            .finish()
    }
}

/// Build the typed client for `ident` over any call target.
pub fn get_proxy<T: FromProxy>(target: Arc<dyn CallTarget>, ident: &ProxyIdentifier<T>) -> T {
    T::from_proxy(RemoteProxy::new(target, ident.service_id()))
}
