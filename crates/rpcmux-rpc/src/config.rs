use std::time::Duration;

/// Configuration for an [`crate::RpcPeer`].
#[derive(Debug, Clone, Default)]
pub struct RpcConfig {
    /// Reject outstanding calls with [`crate::RpcError::Timeout`] after this
    /// long. `None` waits until the channel closes.
    pub call_timeout: Option<Duration>,
}

impl RpcConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}
