use std::sync::Arc;

use rpcmux_mux::{CloseReason, IncomingChannels, Multiplexer, MuxRole};
use rpcmux_rpc::{RpcConfig, RpcPeer, ServiceRegistry};
use rpcmux_transport::TransportDriver;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::error::Result;

/// Serve `registry` on every channel the remote end opens.
pub(crate) async fn serve_incoming(
    mut incoming: IncomingChannels,
    registry: Arc<ServiceRegistry>,
    config: RpcConfig,
) {
    while let Some(channel) = incoming.accept().await {
        debug!(channel = channel.id(), path = channel.path(), "channel accepted");
        RpcPeer::spawn(channel, Arc::clone(&registry), config.clone());
    }
}

/// Accepting side of one transport.
///
/// Runs an [`RpcPeer`] for each channel the client opens. There is no
/// reconnect here: when the transport goes away the connection is done and
/// the client is expected to dial again.
#[derive(Clone)]
pub struct ServerConnection {
    mux: Multiplexer,
    registry: Arc<ServiceRegistry>,
    rpc: RpcConfig,
}

impl ServerConnection {
    /// Start serving on an accepted transport. Must be called inside a
    /// tokio runtime.
    ///
    /// The returned handle owns the connection: dropping every clone of it
    /// shuts the multiplexer down and closes the transport.
    #[must_use = "dropping the ServerConnection closes the transport"]
    pub fn serve(
        driver: Arc<dyn TransportDriver>,
        registry: Arc<ServiceRegistry>,
        config: ConnectionConfig,
    ) -> Self {
        let mux_config = config.mux.with_role(MuxRole::Acceptor);
        let (mux, incoming) = Multiplexer::start(driver, mux_config);
        info!(transport = mux.transport_name(), "serving connection");
        tokio::spawn(serve_incoming(
            incoming,
            Arc::clone(&registry),
            config.rpc.clone(),
        ));
        Self {
            mux,
            registry,
            rpc: config.rpc,
        }
    }

    /// Open a channel towards the client, for calls into services the client
    /// exposes.
    pub async fn open_peer(&self, path: &str) -> Result<RpcPeer> {
        let channel = self.mux.open_channel(path).await?;
        Ok(RpcPeer::spawn(
            channel,
            Arc::clone(&self.registry),
            self.rpc.clone(),
        ))
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn channel_count(&self) -> usize {
        self.mux.channel_count()
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Wait until the transport is gone.
    pub async fn closed(&self) -> CloseReason {
        self.mux.closed().await
    }

    pub async fn shutdown(&self) {
        self.mux.shutdown().await;
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("mux", &self.mux)
            .finish_non_exhaustive()
    }
}
