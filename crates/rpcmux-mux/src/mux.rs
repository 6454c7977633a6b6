use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rpcmux_transport::{Disposable, TransportDriver};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::channel::{
    Channel, ChannelEvent, ChannelInfo, ChannelState, CloseReason, IncomingChannels,
};
use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::message::{ChannelMessage, MessageKind, Payload};

/// Error code sent when an inbound open has nobody to accept it.
pub const ERROR_NO_ACCEPTOR: u32 = 404;

pub(crate) enum Command {
    Open {
        path: String,
        reply: oneshot::Sender<Result<Channel>>,
    },
    Write {
        id: String,
        frame: Bytes,
    },
    Close {
        id: String,
    },
    Ping {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
    Inbound(Bytes),
    TransportClosed,
    TransportError(String),
}

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    closed: watch::Receiver<Option<CloseReason>>,
    channel_count: Arc<AtomicUsize>,
    open_timeout: Duration,
    transport: &'static str,
    driver: Arc<dyn TransportDriver>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Many logical channels over one transport driver.
///
/// A single background task owns every channel's state; this handle and the
/// channel handles talk to it through a command queue. Dropping the last
/// `Multiplexer` clone shuts the task down and closes the driver.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    /// Attach to `driver` and start the event loop. Must be called inside a
    /// tokio runtime.
    pub fn start(driver: Arc<dyn TransportDriver>, config: MuxConfig) -> (Self, IncomingChannels) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(None);
        let channel_count = Arc::new(AtomicUsize::new(0));
        let transport = driver.name();
        let open_timeout = config.open_timeout;

        let registrations = register_driver_callbacks(driver.as_ref(), &commands);
        debug!(
            transport,
            client_id = %config.client_id,
            role = ?config.role,
            "multiplexer started"
        );

        let event_loop = EventLoop {
            driver: Arc::clone(&driver),
            commands: commands.clone(),
            channels: HashMap::new(),
            awaiting_ready: HashMap::new(),
            incoming: incoming_tx,
            pings: HashMap::new(),
            next_channel: 0,
            next_ping: 0,
            channel_count: Arc::clone(&channel_count),
            config,
        };
        tokio::spawn(event_loop.run(command_rx, closed_tx, registrations));

        let mux = Self {
            shared: Arc::new(Shared {
                commands,
                closed: closed_rx,
                channel_count,
                open_timeout,
                transport,
                driver,
            }),
        };
        (
            mux,
            IncomingChannels {
                channels: incoming_rx,
            },
        )
    }

    /// Open a channel for `path` and wait for the remote `ready`.
    pub async fn open_channel(&self, path: impl Into<String>) -> Result<Channel> {
        let (reply, reply_rx) = oneshot::channel();
        self.shared
            .commands
            .send(Command::Open {
                path: path.into(),
                reply,
            })
            .map_err(|_| self.closed_error())?;

        match tokio::time::timeout(self.shared.open_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(MuxError::Timeout(self.shared.open_timeout)),
        }
    }

    /// Round-trip a heartbeat through the remote multiplexer.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let (reply, reply_rx) = oneshot::channel();
        self.shared
            .commands
            .send(Command::Ping { reply })
            .map_err(|_| self.closed_error())?;

        match tokio::time::timeout(self.shared.open_timeout, reply_rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(MuxError::Timeout(self.shared.open_timeout)),
        }
    }

    /// Number of channels currently tracked (connecting or open).
    pub fn channel_count(&self) -> usize {
        self.shared.channel_count.load(Ordering::Acquire)
    }

    /// Whether the event loop has stopped or the transport is already gone.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.borrow().is_some() || self.shared.driver.is_closed()
    }

    /// Name of the underlying transport driver.
    pub fn transport_name(&self) -> &'static str {
        self.shared.transport
    }

    /// Wait until the event loop has stopped and report why.
    pub async fn closed(&self) -> CloseReason {
        let mut closed = self.shared.closed.clone();
        let reason = match closed.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Shutdown),
            Err(_) => CloseReason::Shutdown,
        };
        reason
    }

    /// Close every channel, close the driver, and wait for the loop to stop.
    pub async fn shutdown(&self) {
        let _ = self.shared.commands.send(Command::Shutdown);
        self.closed().await;
    }

    fn closed_error(&self) -> MuxError {
        match self.shared.closed.borrow().as_ref() {
            Some(CloseReason::TransportLost) => MuxError::TransportLost,
            _ => MuxError::Shutdown,
        }
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("transport", &self.shared.transport)
            .field("channels", &self.channel_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn register_driver_callbacks(
    driver: &dyn TransportDriver,
    commands: &mpsc::UnboundedSender<Command>,
) -> Vec<Disposable> {
    let on_message = commands.clone();
    let on_close = commands.clone();
    let on_error = commands.clone();
    vec![
        driver.on_message(Box::new(move |bytes| {
            let _ = on_message.send(Command::Inbound(bytes));
        })),
        driver.on_close(Box::new(move || {
            let _ = on_close.send(Command::TransportClosed);
        })),
        driver.on_error(Box::new(move |err| {
            let _ = on_error.send(Command::TransportError(err.to_string()));
        })),
    ]
}

enum Flow {
    Continue,
    Stop(CloseReason),
}

struct PendingOpen {
    reply: oneshot::Sender<Result<Channel>>,
    channel: Channel,
}

struct ChannelEntry {
    path: String,
    state: watch::Sender<ChannelState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    opening: Option<PendingOpen>,
    last_activity: Instant,
}

impl ChannelEntry {
    fn is_open(&self) -> bool {
        *self.state.borrow() == ChannelState::Open
    }

    fn finish(self, id: &str, reason: CloseReason) {
        debug!(channel = id, path = %self.path, ?reason, "channel closed");
        self.state.send_replace(ChannelState::Closed);
        let _ = self.events.send(ChannelEvent::Closed(reason));
    }
}

struct EventLoop {
    driver: Arc<dyn TransportDriver>,
    config: MuxConfig,
    commands: mpsc::UnboundedSender<Command>,
    channels: HashMap<String, ChannelEntry>,
    awaiting_ready: HashMap<String, HashSet<String>>,
    incoming: mpsc::UnboundedSender<Channel>,
    pings: HashMap<String, oneshot::Sender<()>>,
    next_channel: u64,
    next_ping: u64,
    channel_count: Arc<AtomicUsize>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        closed: watch::Sender<Option<CloseReason>>,
        mut registrations: Vec<Disposable>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => Flow::Stop(CloseReason::Shutdown),
                },
                _ = sweep.tick() => self.sweep(),
            };
            self.channel_count
                .store(self.channels.len(), Ordering::Release);
            if let Flow::Stop(reason) = flow {
                break reason;
            }
        };

        for registration in &mut registrations {
            registration.dispose();
        }
        self.teardown(&reason);
        debug!(transport = self.driver.name(), ?reason, "multiplexer stopped");
        closed.send_replace(Some(reason));
    }

    fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Open { path, reply } => self.open(path, reply),
            Command::Write { id, frame } => match self.channels.get_mut(&id) {
                Some(entry) if entry.is_open() => {
                    entry.last_activity = Instant::now();
                    self.write(frame)
                }
                _ => {
                    trace!(channel = %id, "dropping write for closed channel");
                    Flow::Continue
                }
            },
            Command::Close { id } => match self.channels.remove(&id) {
                Some(entry) => {
                    self.forget_awaiting(&entry.path, &id);
                    self.close_entry(&id, entry, None, CloseReason::Local)
                }
                None => Flow::Continue,
            },
            Command::Ping { reply } => {
                self.next_ping += 1;
                let nonce = format!("p-{}", self.next_ping);
                self.pings.insert(nonce.clone(), reply);
                self.send(&ChannelMessage::ping(&self.config.client_id, &nonce))
            }
            Command::Shutdown => Flow::Stop(CloseReason::Shutdown),
            Command::Inbound(bytes) => self.inbound(&bytes),
            Command::TransportClosed => {
                debug!(transport = self.driver.name(), "transport closed");
                Flow::Stop(CloseReason::TransportLost)
            }
            Command::TransportError(err) => {
                warn!(transport = self.driver.name(), error = %err, "transport error");
                Flow::Stop(CloseReason::TransportLost)
            }
        }
    }

    fn open(&mut self, path: String, reply: oneshot::Sender<Result<Channel>>) -> Flow {
        self.next_channel += 1;
        let id = format!("{}-{}", self.config.role.id_prefix(), self.next_channel);
        let client_id = self.config.client_id.clone();
        let (entry, channel) = self.new_entry(&id, &path, &client_id, ChannelState::Connecting);

        self.channels.insert(
            id.clone(),
            ChannelEntry {
                opening: Some(PendingOpen { reply, channel }),
                ..entry
            },
        );
        self.awaiting_ready
            .entry(path.clone())
            .or_default()
            .insert(id.clone());

        debug!(channel = %id, path = %path, "opening channel");
        self.send(&ChannelMessage::open(&client_id, &id, &path))
    }

    fn new_entry(
        &self,
        id: &str,
        path: &str,
        client_id: &str,
        state: ChannelState,
    ) -> (ChannelEntry, Channel) {
        let (state_tx, state_rx) = watch::channel(state);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Channel::new(
            ChannelInfo {
                id: id.to_owned(),
                path: path.to_owned(),
                client_id: client_id.to_owned(),
                local_client_id: self.config.client_id.clone(),
            },
            self.commands.clone(),
            state_rx,
            events_rx,
        );
        let entry = ChannelEntry {
            path: path.to_owned(),
            state: state_tx,
            events: events_tx,
            opening: None,
            last_activity: Instant::now(),
        };
        (entry, channel)
    }

    fn inbound(&mut self, bytes: &[u8]) -> Flow {
        let message = match rpcmux_frame::decode_with_config(bytes, &self.config.frame)
            .map_err(MuxError::from)
            .and_then(ChannelMessage::from_frame)
        {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, len = bytes.len(), "dropping malformed frame");
                return Flow::Continue;
            }
        };
        trace!(kind = ?message.kind, channel = %message.id, "inbound control message");

        match message.kind {
            MessageKind::Open => self.remote_open(message),
            MessageKind::Ready => self.remote_ready(message),
            MessageKind::Data => {
                self.remote_data(message);
                Flow::Continue
            }
            MessageKind::Close => {
                self.remote_close(&message.id, CloseReason::Remote {
                    reason: message.reason,
                });
                Flow::Continue
            }
            MessageKind::Error => {
                self.remote_close(&message.id, CloseReason::Error {
                    code: message.code.unwrap_or_default(),
                    reason: message.reason.unwrap_or_default(),
                });
                Flow::Continue
            }
            MessageKind::Ping => self.send(&ChannelMessage::pong(&self.config.client_id, &message.id)),
            MessageKind::Pong => {
                if let Some(reply) = self.pings.remove(&message.id) {
                    let _ = reply.send(());
                }
                Flow::Continue
            }
        }
    }

    fn remote_open(&mut self, message: ChannelMessage) -> Flow {
        let Some(path) = message.path else {
            warn!(channel = %message.id, "open without path");
            return Flow::Continue;
        };
        if self.channels.contains_key(&message.id) {
            debug!(channel = %message.id, "duplicate open ignored");
            return Flow::Continue;
        }

        let (entry, channel) =
            self.new_entry(&message.id, &path, &message.client_id, ChannelState::Open);
        if self.incoming.send(channel).is_err() {
            debug!(channel = %message.id, path = %path, "no acceptor for inbound channel");
            return self.send(&ChannelMessage::error(
                &self.config.client_id,
                &message.id,
                ERROR_NO_ACCEPTOR,
                &format!("no acceptor for path '{path}'"),
            ));
        }

        debug!(channel = %message.id, path = %path, client_id = %message.client_id, "accepted channel");
        self.channels.insert(message.id.clone(), entry);
        self.send(&ChannelMessage::ready(
            &self.config.client_id,
            &message.id,
            &path,
        ))
    }

    fn remote_ready(&mut self, message: ChannelMessage) -> Flow {
        let Some(entry) = self.channels.get_mut(&message.id) else {
            debug!(channel = %message.id, "ready for unknown channel ignored");
            return Flow::Continue;
        };
        let Some(opening) = entry.opening.take() else {
            debug!(channel = %message.id, "duplicate ready ignored");
            return Flow::Continue;
        };

        let path = entry.path.clone();
        entry.state.send_replace(ChannelState::Open);
        entry.last_activity = Instant::now();
        self.forget_awaiting(&path, &message.id);

        if opening.reply.send(Ok(opening.channel)).is_err() {
            debug!(channel = %message.id, "opener went away before ready");
            if let Some(entry) = self.channels.remove(&message.id) {
                return self.close_entry(&message.id, entry, Some("abandoned"), CloseReason::Local);
            }
        }
        debug!(channel = %message.id, path = %path, "channel open");
        Flow::Continue
    }

    fn remote_data(&mut self, message: ChannelMessage) {
        match self.channels.get_mut(&message.id) {
            Some(entry) if entry.is_open() => {
                entry.last_activity = Instant::now();
                let content = message
                    .content
                    .unwrap_or_else(|| Payload::Text(String::new()));
                let _ = entry.events.send(ChannelEvent::Data(content));
            }
            _ => trace!(channel = %message.id, "data for unknown channel dropped"),
        }
    }

    fn remote_close(&mut self, id: &str, reason: CloseReason) {
        let Some(mut entry) = self.channels.remove(id) else {
            return;
        };
        self.forget_awaiting(&entry.path, id);
        if let Some(opening) = entry.opening.take() {
            let (code, why) = match &reason {
                CloseReason::Error { code, reason } => (*code, reason.clone()),
                CloseReason::Remote { reason } => (0, reason.clone().unwrap_or_default()),
                _ => (0, String::new()),
            };
            let _ = opening.reply.send(Err(MuxError::OpenRejected {
                path: entry.path.clone(),
                code,
                reason: why,
            }));
        }
        entry.finish(id, reason);
    }

    /// Close idle channels, channels whose receiver is gone, and opens whose
    /// caller stopped waiting.
    fn sweep(&mut self) -> Flow {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let expired: Vec<(String, CloseReason)> = self
            .channels
            .iter()
            .filter_map(|(id, entry)| {
                if let Some(opening) = &entry.opening {
                    return opening
                        .reply
                        .is_closed()
                        .then(|| (id.clone(), CloseReason::Local));
                }
                if entry.events.is_closed() {
                    return Some((id.clone(), CloseReason::Local));
                }
                match idle_timeout {
                    Some(idle) if now.duration_since(entry.last_activity) >= idle => {
                        Some((id.clone(), CloseReason::IdleTimeout))
                    }
                    _ => None,
                }
            })
            .collect();

        for (id, reason) in expired {
            let Some(entry) = self.channels.remove(&id) else {
                continue;
            };
            self.forget_awaiting(&entry.path, &id);
            let note = match reason {
                CloseReason::IdleTimeout => "idle timeout",
                _ => "abandoned",
            };
            if let Flow::Stop(stop) = self.close_entry(&id, entry, Some(note), reason) {
                return Flow::Stop(stop);
            }
        }
        Flow::Continue
    }

    fn close_entry(
        &self,
        id: &str,
        mut entry: ChannelEntry,
        note: Option<&str>,
        reason: CloseReason,
    ) -> Flow {
        entry.state.send_replace(ChannelState::Closing);
        let flow = self.send(&ChannelMessage::close(&self.config.client_id, id, note));
        if let Some(opening) = entry.opening.take() {
            let _ = opening
                .reply
                .send(Err(MuxError::ChannelClosed(id.to_owned())));
        }
        entry.finish(id, reason);
        flow
    }

    fn forget_awaiting(&mut self, path: &str, id: &str) {
        if let Some(ids) = self.awaiting_ready.get_mut(path) {
            ids.remove(id);
            if ids.is_empty() {
                self.awaiting_ready.remove(path);
            }
        }
    }

    fn send(&self, message: &ChannelMessage) -> Flow {
        match message.encode() {
            Ok(frame) => self.write(frame),
            Err(err) => {
                warn!(error = %err, kind = ?message.kind, "failed to encode control message");
                Flow::Continue
            }
        }
    }

    fn write(&self, frame: Bytes) -> Flow {
        match self.driver.send(frame) {
            Ok(()) => Flow::Continue,
            Err(err) => {
                warn!(transport = self.driver.name(), error = %err, "transport send failed");
                Flow::Stop(CloseReason::TransportLost)
            }
        }
    }

    fn teardown(&mut self, reason: &CloseReason) {
        let notify_remote = *reason == CloseReason::Shutdown && !self.driver.is_closed();
        for (id, mut entry) in self.channels.drain() {
            if notify_remote {
                if let Ok(frame) =
                    ChannelMessage::close(&self.config.client_id, &id, Some("shutdown")).encode()
                {
                    let _ = self.driver.send(frame);
                }
            }
            if let Some(opening) = entry.opening.take() {
                let err = match reason {
                    CloseReason::TransportLost => MuxError::TransportLost,
                    _ => MuxError::Shutdown,
                };
                let _ = opening.reply.send(Err(err));
            }
            entry.finish(&id, reason.clone());
        }
        self.awaiting_ready.clear();
        self.pings.clear();
        self.channel_count.store(0, Ordering::Release);
        self.driver.close();
    }
}
