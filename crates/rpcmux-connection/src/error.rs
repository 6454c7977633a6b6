/// Errors that can occur while establishing or managing a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] rpcmux_transport::TransportError),

    /// Multiplexer error.
    #[error("multiplexer error: {0}")]
    Mux(#[from] rpcmux_mux::MuxError),

    /// RPC error.
    #[error("rpc error: {0}")]
    Rpc(#[from] rpcmux_rpc::RpcError),

    /// The initial connection could not be established.
    #[error("connect failed after {attempts} attempts: {source}")]
    ConnectFailed {
        attempts: u32,
        source: rpcmux_transport::TransportError,
    },

    /// The manager has been disposed.
    #[error("connection manager disposed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
