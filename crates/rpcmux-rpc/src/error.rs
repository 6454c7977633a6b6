use std::time::Duration;

use rpcmux_mux::MuxError;

use crate::registry::INVALID_ARGUMENTS;
use crate::serialized_error::{RemoteError, SerializedError};

/// Errors that can occur in RPC operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// A service id or method contains the name separator, or an RPC name
    /// could not be split.
    #[error("invalid rpc name: {0}")]
    InvalidName(String),

    /// No registered service handles the method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// The channel closed before the call completed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The underlying connection was lost before the call completed.
    #[error("connection lost")]
    ConnectionLost,

    /// No response within the configured call timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The call was cancelled.
    #[error("call cancelled")]
    Cancelled,

    /// An argument holds a value tagged as an error that is not one. Carries
    /// the JSON pointer of the offending value.
    #[error("malformed error value in arguments at {0}")]
    InvalidErrorArg(String),

    /// The remote method failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// JSON encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Multiplexer error.
    #[error("multiplexer error: {0}")]
    Mux(#[from] MuxError),
}

impl RpcError {
    /// Error category, matching the `name` field of the serialized form.
    pub fn name(&self) -> &str {
        match self {
            RpcError::InvalidName(_) => "InvalidName",
            RpcError::MethodNotFound(_) => "MethodNotFound",
            RpcError::ChannelClosed(_) => "ChannelClosed",
            RpcError::ConnectionLost => "ConnectionLost",
            RpcError::Timeout(_) => "Timeout",
            RpcError::Cancelled => "Cancelled",
            RpcError::InvalidErrorArg(_) => INVALID_ARGUMENTS,
            RpcError::Remote(err) => err.name(),
            RpcError::Codec(_) => "CodecError",
            RpcError::Mux(_) => "MuxError",
        }
    }

    /// Serialize for transmission as a call rejection.
    pub fn to_serialized(&self) -> SerializedError {
        let message = match self {
            RpcError::Remote(err) => return SerializedError::from_remote(err),
            RpcError::InvalidName(detail)
            | RpcError::MethodNotFound(detail)
            | RpcError::ChannelClosed(detail) => detail.clone(),
            other => other.to_string(),
        };
        let mut serialized = SerializedError::new(self.name(), message);
        if let Some(source) = std::error::Error::source(self) {
            serialized = serialized.with_cause(SerializedError::from_error(source));
        }
        serialized
    }

    /// Rebuild an error received from the remote end.
    ///
    /// Transport categories map back to their variants; everything else
    /// becomes [`RpcError::Remote`].
    pub fn from_serialized(error: SerializedError) -> Self {
        match error.name.as_str() {
            "MethodNotFound" => RpcError::MethodNotFound(error.message),
            "ChannelClosed" => RpcError::ChannelClosed(error.message),
            "ConnectionLost" => RpcError::ConnectionLost,
            _ => RpcError::Remote(error.revive()),
        }
    }

    /// Whether the call failed because its channel or connection went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, RpcError::ChannelClosed(_) | RpcError::ConnectionLost)
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_categories_survive_serialization() {
        for err in [
            RpcError::MethodNotFound("svc#m".to_string()),
            RpcError::ChannelClosed("i-1".to_string()),
            RpcError::ConnectionLost,
        ] {
            let name = err.name().to_string();
            let message = err.to_string();
            let revived = RpcError::from_serialized(err.to_serialized());
            assert_eq!(revived.name(), name);
            assert_eq!(revived.to_string(), message);
        }
    }

    #[test]
    fn application_errors_become_remote() {
        let serialized = SerializedError::new("ValidationError", "bad input");
        let err = RpcError::from_serialized(serialized.clone());
        assert!(matches!(err, RpcError::Remote(_)));
        assert_eq!(err.name(), "ValidationError");
        assert_eq!(err.to_serialized(), serialized);
    }

    #[test]
    fn mux_errors_carry_cause() {
        let err = RpcError::Mux(MuxError::TransportLost);
        let serialized = err.to_serialized();
        assert_eq!(serialized.name, "MuxError");
        assert_eq!(serialized.cause.as_deref().map(|c| c.message.as_str()), Some("transport lost"));
    }
}
