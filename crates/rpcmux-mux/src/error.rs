use std::time::Duration;

/// Errors that can occur in multiplexer operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] rpcmux_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] rpcmux_frame::FrameError),

    /// JSON control message could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A control message is structurally invalid.
    #[error("malformed control message: {0}")]
    Malformed(String),

    /// The channel is closed.
    #[error("channel {0} is closed")]
    ChannelClosed(String),

    /// The remote end refused to open a channel.
    #[error("open of channel for path '{path}' rejected ({code}): {reason}")]
    OpenRejected {
        path: String,
        code: u32,
        reason: String,
    },

    /// The multiplexer has been shut down locally.
    #[error("multiplexer shut down")]
    Shutdown,

    /// The underlying transport was lost.
    #[error("transport lost")]
    TransportLost,

    /// An open or ping did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, MuxError>;
