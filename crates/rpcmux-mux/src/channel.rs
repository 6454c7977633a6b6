use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, watch};

use crate::error::{MuxError, Result};
use crate::message::{ChannelMessage, Payload};
use crate::mux::Command;

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why a channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this end.
    Local,
    /// The remote end sent `close`.
    Remote { reason: Option<String> },
    /// The remote end sent `error`.
    Error { code: u32, reason: String },
    /// The transport was closed or failed.
    TransportLost,
    /// No traffic within the configured idle timeout.
    IdleTimeout,
    /// The multiplexer was shut down locally.
    Shutdown,
}

impl CloseReason {
    /// Whether the close was caused by the loss of the whole transport.
    pub fn is_transport_loss(&self) -> bool {
        matches!(self, CloseReason::TransportLost)
    }
}

/// Item delivered to a [`ChannelReceiver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Payload),
    Closed(CloseReason),
}

#[derive(Debug)]
pub(crate) struct ChannelInfo {
    pub(crate) id: String,
    pub(crate) path: String,
    pub(crate) client_id: String,
    pub(crate) local_client_id: String,
}

/// A logical, ordered, bidirectional message stream.
///
/// The multiplexer owns the channel's state; this handle can only send,
/// receive, and request close.
#[derive(Debug)]
pub struct Channel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl Channel {
    pub(crate) fn new(
        info: ChannelInfo,
        commands: mpsc::UnboundedSender<Command>,
        state: watch::Receiver<ChannelState>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        let info = Arc::new(info);
        Self {
            sender: ChannelSender {
                info: Arc::clone(&info),
                commands,
                state: state.clone(),
            },
            receiver: ChannelReceiver {
                info,
                state,
                events,
            },
        }
    }

    pub fn id(&self) -> &str {
        self.sender.id()
    }

    pub fn path(&self) -> &str {
        self.sender.path()
    }

    /// Client id of the side that opened the channel.
    pub fn client_id(&self) -> &str {
        self.sender.client_id()
    }

    pub fn state(&self) -> ChannelState {
        self.sender.state()
    }

    pub fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        self.sender.send(payload)
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.receiver.recv().await
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    /// Split into independently owned send and receive halves.
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a [`Channel`]. Cheap to clone.
#[derive(Clone)]
pub struct ChannelSender {
    info: Arc<ChannelInfo>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
}

impl ChannelSender {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn path(&self) -> &str {
        &self.info.path
    }

    pub fn client_id(&self) -> &str {
        &self.info.client_id
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Queue `payload` for delivery on this channel.
    ///
    /// Encoding happens here so codec failures are reported to the caller;
    /// the write itself is performed by the multiplexer task in order.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        if self.is_closed() {
            return Err(MuxError::ChannelClosed(self.info.id.clone()));
        }
        let message = ChannelMessage::data(&self.info.local_client_id, &self.info.id, payload.into());
        let frame = message.encode()?;
        self.commands
            .send(Command::Write {
                id: self.info.id.clone(),
                frame,
            })
            .map_err(|_| MuxError::ChannelClosed(self.info.id.clone()))
    }

    /// Ask the multiplexer to close this channel. Idempotent.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        let _ = self.commands.send(Command::Close {
            id: self.info.id.clone(),
        });
    }

    /// Wait until the channel reaches [`ChannelState::Closed`].
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|state| *state == ChannelState::Closed).await;
    }
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender")
            .field("id", &self.info.id)
            .field("path", &self.info.path)
            .field("state", &self.state())
            .finish()
    }
}

/// Receiving half of a [`Channel`].
///
/// Yields data in send order, then a single [`ChannelEvent::Closed`], then
/// `None`.
pub struct ChannelReceiver {
    info: Arc<ChannelInfo>,
    state: watch::Receiver<ChannelState>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelReceiver {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn path(&self) -> &str {
        &self.info.path
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }
}

impl futures_core::Stream for ChannelReceiver {
    type Item = ChannelEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl std::fmt::Debug for ChannelReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelReceiver")
            .field("id", &self.info.id)
            .field("path", &self.info.path)
            .field("state", &self.state())
            .finish()
    }
}

/// Queue of channels opened by the remote end.
pub struct IncomingChannels {
    pub(crate) channels: mpsc::UnboundedReceiver<Channel>,
}

impl IncomingChannels {
    /// Wait for the next remotely opened channel. Returns `None` once the
    /// multiplexer has stopped.
    pub async fn accept(&mut self) -> Option<Channel> {
        self.channels.recv().await
    }
}

impl futures_core::Stream for IncomingChannels {
    type Item = Channel;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.channels.poll_recv(cx)
    }
}

impl std::fmt::Debug for IncomingChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingChannels").finish_non_exhaustive()
    }
}
