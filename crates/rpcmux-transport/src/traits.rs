use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::error::{Result, TransportError};
use crate::events::Disposable;

/// Boxed future used at async trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback invoked for every inbound message.
pub type MessageCallback = Box<dyn Fn(Bytes) + Send + Sync>;

/// Callback invoked once when the transport closes.
pub type CloseCallback = Box<dyn Fn() + Send + Sync>;

/// Callback invoked for transport-level failures.
pub type ErrorCallback = Box<dyn Fn(&TransportError) + Send + Sync>;

/// One physical duplex message channel.
///
/// Every concrete transport (in-process port, unix socket, ...) implements
/// this trait. Layers above it never see transport-specific types; a driver
/// delivers whole messages, so stream transports must frame internally.
pub trait TransportDriver: Send + Sync + 'static {
    /// Queue one message for delivery to the remote end.
    fn send(&self, message: Bytes) -> Result<()>;

    /// Register a callback for inbound messages.
    fn on_message(&self, callback: MessageCallback) -> Disposable;

    /// Register a callback for transport close (local or remote).
    fn on_close(&self, callback: CloseCallback) -> Disposable;

    /// Register a callback for transport errors.
    fn on_error(&self, callback: ErrorCallback) -> Disposable;

    /// Close the transport. Idempotent.
    fn close(&self);

    /// Whether the transport is closed.
    fn is_closed(&self) -> bool;

    /// Transport name for diagnostics.
    fn name(&self) -> &'static str;
}
