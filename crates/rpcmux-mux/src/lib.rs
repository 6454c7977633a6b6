//! Channel multiplexer for rpcmux.
//!
//! Runs many logical [`Channel`]s over a single
//! [`rpcmux_transport::TransportDriver`]. Each channel is identified by
//! `(client_id, id, path)` and moves through
//! `Connecting -> Open -> Closing -> Closed`.
//!
//! ```text
//!  open_channel("svc") ──open──▶  remote accept queue
//!                      ◀─ready──
//!  send(payload)       ──data──▶  ChannelReceiver::recv()
//!  close()             ──close─▶  ChannelEvent::Closed(Remote)
//! ```
//!
//! Transport loss closes every channel with [`CloseReason::TransportLost`];
//! this layer never retries.

pub mod channel;
pub mod config;
pub mod error;
pub mod message;
pub mod mux;

pub use channel::{
    Channel, ChannelEvent, ChannelReceiver, ChannelSender, ChannelState, CloseReason,
    IncomingChannels,
};
pub use config::{MuxConfig, MuxRole};
pub use error::{MuxError, Result};
pub use message::{ChannelMessage, MessageKind, Payload};
pub use mux::{Multiplexer, ERROR_NO_ACCEPTOR};
