//! Connection management for rpcmux.
//!
//! The layer callers usually talk to. A [`ConnectionManager`] dials through a
//! [`Connector`], keeps one multiplexer per live transport, and reconnects
//! with backoff after a loss, re-opening every channel path it has used.
//! [`ServerConnection`] is the accepting side of a single transport.

pub mod backoff;
pub mod config;
pub mod connector;
pub mod error;
pub mod manager;
pub mod server;

pub use backoff::Backoff;
pub use config::{ConnectionConfig, ReconnectConfig};
#[cfg(unix)]
pub use connector::UnixSocketConnector;
pub use connector::{Connector, FnConnector};
pub use error::{ConnectionError, Result};
pub use manager::{ConnectionManager, ConnectionState};
pub use server::ServerConnection;
