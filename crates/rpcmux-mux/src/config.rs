use std::time::Duration;

use rpcmux_frame::FrameConfig;

/// Which end of the transport this multiplexer sits on.
///
/// The role only prefixes locally generated channel ids (`i-` / `a-`) so
/// that both ends can open channels without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MuxRole {
    #[default]
    Initiator,
    Acceptor,
}

impl MuxRole {
    pub(crate) fn id_prefix(self) -> &'static str {
        match self {
            MuxRole::Initiator => "i",
            MuxRole::Acceptor => "a",
        }
    }
}

/// Configuration for a [`crate::Multiplexer`].
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Client id stamped on every outbound control message.
    pub client_id: String,
    /// Role used for channel id generation.
    pub role: MuxRole,
    /// How long `open_channel` and `ping` wait for the remote end.
    pub open_timeout: Duration,
    /// Close channels that saw no traffic for this long. `None` disables.
    pub idle_timeout: Option<Duration>,
    /// Packet codec limits for inbound frames.
    pub frame: FrameConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            client_id: format!("rpcmux-{}", std::process::id()),
            role: MuxRole::Initiator,
            open_timeout: Duration::from_secs(5),
            idle_timeout: None,
            frame: FrameConfig::default(),
        }
    }
}

impl MuxConfig {
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_role(mut self, role: MuxRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    /// Period of the housekeeping sweep (idle channels, abandoned opens).
    pub(crate) fn sweep_interval(&self) -> Duration {
        const DEFAULT_SWEEP: Duration = Duration::from_millis(250);
        const MIN_SWEEP: Duration = Duration::from_millis(10);
        match self.idle_timeout {
            Some(idle) => (idle / 4).clamp(MIN_SWEEP, DEFAULT_SWEEP),
            None => DEFAULT_SWEEP,
        }
    }
}
