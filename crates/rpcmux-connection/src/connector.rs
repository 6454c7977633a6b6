use std::future::Future;
use std::sync::Arc;

use rpcmux_transport::{BoxFuture, TransportDriver, TransportError};

/// Produces a fresh transport driver for each connection attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<Arc<dyn TransportDriver>, TransportError>>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}

/// Connects to a unix domain socket path.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixSocketConnector {
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl UnixSocketConnector {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(unix)]
impl Connector for UnixSocketConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Arc<dyn TransportDriver>, TransportError>> {
        let path = self.path.clone();
        Box::pin(async move {
            let driver = rpcmux_transport::UnixSocketDriver::connect(&path).await?;
            Ok(Arc::new(driver) as Arc<dyn TransportDriver>)
        })
    }

    fn describe(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

/// Connector backed by a closure, for in-process transports and tests.
pub struct FnConnector<F> {
    connect: F,
    name: String,
}

impl<F, Fut> FnConnector<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn TransportDriver>, TransportError>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, connect: F) -> Self {
        Self {
            connect,
            name: name.into(),
        }
    }
}

impl<F, Fut> Connector for FnConnector<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn TransportDriver>, TransportError>> + Send + 'static,
{
    fn connect(&self) -> BoxFuture<'static, Result<Arc<dyn TransportDriver>, TransportError>> {
        Box::pin((self.connect)())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

impl<F> std::fmt::Debug for FnConnector<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnConnector").field("name", &self.name).finish()
    }
}
