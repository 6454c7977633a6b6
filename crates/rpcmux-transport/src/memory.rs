use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::events::{Disposable, DriverEvents};
use crate::traits::{CloseCallback, ErrorCallback, MessageCallback, TransportDriver};

struct Link {
    open: AtomicBool,
    left: DriverEvents,
    right: DriverEvents,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// In-process duplex message port.
///
/// Created in connected pairs with [`MemoryDriver::pair`]. Messages sent on
/// one end are delivered synchronously, in order, to the other end's message
/// callbacks. This models a worker message port and is what tests use to
/// drive the upper layers without sockets.
pub struct MemoryDriver {
    link: Arc<Link>,
    side: Side,
}

impl MemoryDriver {
    /// Create two connected drivers.
    pub fn pair() -> (Self, Self) {
        let link = Arc::new(Link {
            open: AtomicBool::new(true),
            left: DriverEvents::new(),
            right: DriverEvents::new(),
        });
        (
            Self {
                link: Arc::clone(&link),
                side: Side::Left,
            },
            Self {
                link,
                side: Side::Right,
            },
        )
    }

    fn local(&self) -> &DriverEvents {
        match self.side {
            Side::Left => &self.link.left,
            Side::Right => &self.link.right,
        }
    }

    fn remote(&self) -> &DriverEvents {
        match self.side {
            Side::Left => &self.link.right,
            Side::Right => &self.link.left,
        }
    }

    /// Simulate abrupt transport loss: both ends observe close.
    pub fn sever(&self) {
        self.shutdown_link();
    }

    /// Simulate an I/O failure on this end followed by loss of the link.
    pub fn fail(&self, error: TransportError) {
        self.local().fire_error(&error);
        self.shutdown_link();
    }

    fn shutdown_link(&self) {
        if self.link.open.swap(false, Ordering::AcqRel) {
            debug!("memory transport closed");
            self.link.left.fire_close();
            self.link.right.fire_close();
        }
    }
}

impl TransportDriver for MemoryDriver {
    fn send(&self, message: Bytes) -> Result<()> {
        if !self.link.open.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.remote().fire_message(message);
        Ok(())
    }

    fn on_message(&self, callback: MessageCallback) -> Disposable {
        self.local().on_message(callback)
    }

    fn on_close(&self, callback: CloseCallback) -> Disposable {
        self.local().on_close(callback)
    }

    fn on_error(&self, callback: ErrorCallback) -> Disposable {
        self.local().on_error(callback)
    }

    fn close(&self) {
        self.shutdown_link();
    }

    fn is_closed(&self) -> bool {
        !self.link.open.load(Ordering::Acquire)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

impl std::fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDriver")
            .field("closed", &self.is_closed())
            .finish()
    }
}
