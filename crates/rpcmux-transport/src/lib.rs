//! Duplex message transport abstraction.
//!
//! Every physical connection used by rpcmux is wrapped in a
//! [`TransportDriver`]: whole-message `send`, plus message/close/error
//! callbacks that return a [`Disposable`]. Implementations:
//! - [`MemoryDriver`] — in-process message port pair
//! - [`UnixSocketDriver`] — unix domain socket (Linux/macOS)
//!
//! This is the lowest layer of rpcmux. Everything else builds on the trait.

pub mod error;
pub mod events;
pub mod memory;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use events::{Disposable, DriverEvents, Emitter};
pub use memory::MemoryDriver;
pub use traits::{BoxFuture, CloseCallback, ErrorCallback, MessageCallback, TransportDriver};

#[cfg(unix)]
pub use uds::{UnixSocketDriver, UnixSocketListener, DEFAULT_MAX_MESSAGE_SIZE};
