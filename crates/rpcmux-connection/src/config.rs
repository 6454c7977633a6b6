use std::time::Duration;

use rpcmux_mux::MuxConfig;
use rpcmux_rpc::RpcConfig;

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Attempts allowed for the initial connect. `None` retries forever.
    /// Reconnects after a loss always retry until disposed.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

impl ReconnectConfig {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }
}

/// Configuration for a [`crate::ConnectionManager`] or
/// [`crate::ServerConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub mux: MuxConfig,
    pub rpc: RpcConfig,
    pub reconnect: ReconnectConfig,
    /// How long a call issued while not connected waits for the connection
    /// before failing with `ConnectionLost`.
    pub reconnect_queue_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mux: MuxConfig::default(),
            rpc: RpcConfig::default(),
            reconnect: ReconnectConfig::default(),
            reconnect_queue_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    pub fn with_mux(mut self, mux: MuxConfig) -> Self {
        self.mux = mux;
        self
    }

    pub fn with_rpc(mut self, rpc: RpcConfig) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_reconnect_queue_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_queue_timeout = timeout;
        self
    }
}
