//! Multiplexed binary RPC transport.
//!
//! rpcmux carries many logical channels over one duplex transport and runs
//! typed request/response RPC on top, with reconnecting client connections.
//!
//! # Crate Structure
//!
//! - [`transport`] — Duplex message drivers (in-memory, unix sockets)
//! - [`frame`] — Text/Binary packet codec
//! - [`mux`] — Channel multiplexer
//! - [`rpc`] — RPC envelopes, service registry, peers and proxies
//! - [`connection`] — Reconnecting connection manager and server side
//! - [`common`] — The built-in `CommonServer` service

pub mod common;

/// Re-export transport types.
pub mod transport {
    pub use rpcmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use rpcmux_frame::*;
}

/// Re-export multiplexer types.
pub mod mux {
    pub use rpcmux_mux::*;
}

/// Re-export RPC types.
pub mod rpc {
    pub use rpcmux_rpc::*;
}

/// Re-export connection types.
pub mod connection {
    pub use rpcmux_connection::*;
}
