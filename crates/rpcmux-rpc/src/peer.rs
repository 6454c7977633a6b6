use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use rpcmux_mux::{Channel, ChannelEvent, ChannelReceiver, ChannelSender, CloseReason, Payload};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, trace, warn};

use crate::config::RpcConfig;
use crate::envelope::{Envelope, RequestId};
use crate::error::{Result, RpcError};
use crate::name::get_rpc_name;
use crate::proxy::{FromProxy, ProxyIdentifier, RemoteProxy};
use crate::registry::{MethodResult, ServiceRegistry};
use crate::serialized_error::{normalize_error_args, SerializedError};

/// Error name used when a registered method panics.
pub const HANDLER_PANIC: &str = "HandlerPanic";

enum PeerCommand {
    Call {
        id: RequestId,
        name: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<Value>>,
    },
    Cancel {
        id: RequestId,
    },
}

struct PeerShared {
    commands: mpsc::UnboundedSender<PeerCommand>,
    next_id: AtomicU64,
    config: RpcConfig,
    sender: ChannelSender,
    closed: watch::Receiver<Option<CloseReason>>,
}

/// RPC endpoint bound to one channel.
///
/// Both directions run over the same channel: outbound calls made through
/// [`RpcPeer::call`] and inbound calls dispatched to the
/// [`ServiceRegistry`]. A background task owns the pending-call table; it
/// keeps serving inbound calls after every handle is dropped, until the
/// channel closes.
#[derive(Clone)]
pub struct RpcPeer {
    shared: Arc<PeerShared>,
}

impl RpcPeer {
    /// Start serving `channel`. Must be called inside a tokio runtime.
    pub fn spawn(channel: Channel, registry: Arc<ServiceRegistry>, config: RpcConfig) -> Self {
        let (sender, receiver) = channel.split();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(None);
        let (completions, completion_rx) = mpsc::unbounded_channel();

        debug!(channel = sender.id(), path = sender.path(), "rpc peer started");
        let peer_loop = PeerLoop {
            sender: sender.clone(),
            registry,
            pending: HashMap::new(),
            running: HashMap::new(),
            completions,
        };
        tokio::spawn(peer_loop.run(command_rx, receiver, completion_rx, closed_tx));

        Self {
            shared: Arc::new(PeerShared {
                commands,
                next_id: AtomicU64::new(1),
                config,
                sender,
                closed: closed_rx,
            }),
        }
    }

    pub fn channel_id(&self) -> &str {
        self.shared.sender.id()
    }

    pub fn path(&self) -> &str {
        self.shared.sender.path()
    }

    /// Send a call and return a handle that resolves with its outcome.
    ///
    /// Dropping the handle before it resolves cancels the call.
    pub fn start_call(
        &self,
        service_id: &str,
        method: &str,
        mut args: Vec<Value>,
    ) -> Result<PendingCall> {
        let name = get_rpc_name(service_id, method)?;
        normalize_error_args(&mut args).map_err(RpcError::InvalidErrorArg)?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, reply_rx) = oneshot::channel();

        trace!(id, name = %name, "rpc call");
        // If the loop is gone the reply sender is dropped with the command
        // and the pending call resolves from the close reason.
        let _ = self.shared.commands.send(PeerCommand::Call {
            id,
            name,
            args,
            reply,
        });

        Ok(PendingCall {
            id,
            channel: self.channel_id().to_owned(),
            reply: reply_rx,
            commands: self.shared.commands.clone(),
            closed: self.shared.closed.clone(),
            done: false,
        })
    }

    /// Call `service_id#method` and wait for the result, bounded by
    /// [`RpcConfig::call_timeout`].
    pub async fn call(&self, service_id: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        let pending = self.start_call(service_id, method, args)?;
        match self.shared.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RpcError::Timeout(limit)),
            },
            None => pending.await,
        }
    }

    /// Typed client for the service named by `ident`.
    pub fn get_proxy<T: FromProxy>(&self, ident: &ProxyIdentifier<T>) -> T {
        T::from_proxy(RemoteProxy::new(Arc::new(self.clone()), ident.service_id()))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.borrow().is_some()
    }

    /// Wait until the channel has closed and every pending call has been
    /// rejected.
    pub async fn closed(&self) -> CloseReason {
        let mut closed = self.shared.closed.clone();
        let reason = match closed.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Shutdown),
            Err(_) => CloseReason::Shutdown,
        };
        reason
    }

    /// Close the underlying channel.
    pub fn close(&self) {
        self.shared.sender.close();
    }
}

impl std::fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPeer")
            .field("channel", &self.channel_id())
            .field("path", &self.path())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_error(reason: Option<&CloseReason>, channel: &str) -> RpcError {
    match reason {
        Some(CloseReason::TransportLost | CloseReason::Shutdown) | None => RpcError::ConnectionLost,
        Some(_) => RpcError::ChannelClosed(channel.to_owned()),
    }
}

/// An outstanding call.
///
/// Resolves exactly once. Dropping it unresolved, or calling
/// [`PendingCall::cancel`], removes the pending entry and tells the remote
/// end to abort the handler.
#[must_use = "dropping a PendingCall cancels it"]
pub struct PendingCall {
    id: RequestId,
    channel: String,
    reply: oneshot::Receiver<Result<Value>>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    closed: watch::Receiver<Option<CloseReason>>,
    done: bool,
}

impl PendingCall {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Abandon the call.
    pub fn cancel(mut self) {
        self.send_cancel();
    }

    fn send_cancel(&mut self) {
        if !self.done {
            self.done = true;
            let _ = self.commands.send(PeerCommand::Cancel { id: self.id });
        }
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(RpcError::Cancelled));
        }
        match Pin::new(&mut this.reply).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                this.done = true;
                Poll::Ready(outcome)
            }
            Poll::Ready(Err(_)) => {
                this.done = true;
                let reason = this.closed.borrow().clone();
                Poll::Ready(Err(closed_error(reason.as_ref(), &this.channel)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.send_cancel();
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish()
    }
}

struct PeerLoop {
    sender: ChannelSender,
    registry: Arc<ServiceRegistry>,
    pending: HashMap<RequestId, oneshot::Sender<Result<Value>>>,
    running: HashMap<RequestId, AbortHandle>,
    completions: mpsc::UnboundedSender<(RequestId, MethodResult)>,
}

impl PeerLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
        mut receiver: ChannelReceiver,
        mut completion_rx: mpsc::UnboundedReceiver<(RequestId, MethodResult)>,
        closed: watch::Sender<Option<CloseReason>>,
    ) {
        let mut commands_open = true;
        let reason = loop {
            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => commands_open = false,
                },
                event = receiver.recv() => match event {
                    Some(ChannelEvent::Data(payload)) => self.handle_payload(&payload),
                    Some(ChannelEvent::Closed(reason)) => break reason,
                    None => break CloseReason::Shutdown,
                },
                Some((id, outcome)) = completion_rx.recv() => self.handle_completion(id, outcome),
            }
        };

        let channel = self.sender.id().to_owned();
        debug!(
            channel = %channel,
            ?reason,
            pending = self.pending.len(),
            running = self.running.len(),
            "rpc peer stopped"
        );
        // Publish the reason first so replies dropped below map correctly.
        closed.send_replace(Some(reason.clone()));
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(closed_error(Some(&reason), &channel)));
        }
        for (_, task) in self.running.drain() {
            task.abort();
        }
    }

    fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Call {
                id,
                name,
                args,
                reply,
            } => {
                let envelope = Envelope::Call { id, name, args };
                match self.send(&envelope) {
                    // A closed channel already has its close event queued;
                    // the call is rejected with the close reason.
                    Ok(()) | Err(RpcError::ChannelClosed(_)) => {
                        self.pending.insert(id, reply);
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            PeerCommand::Cancel { id } => {
                if self.pending.remove(&id).is_some() {
                    debug!(id, "cancelling call");
                    let _ = self.send(&Envelope::Cancel { id });
                }
            }
        }
    }

    fn handle_payload(&mut self, payload: &Payload) {
        let envelope = match Envelope::from_payload(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(channel = self.sender.id(), error = %err, "dropping malformed envelope");
                return;
            }
        };

        match envelope {
            Envelope::Call { id, name, args } => self.dispatch(id, name, args),
            Envelope::Result { id, result } => self.settle(id, Ok(result)),
            Envelope::Error { id, error } => self.settle(id, Err(RpcError::from_serialized(error))),
            Envelope::Cancel { id } => {
                if let Some(task) = self.running.remove(&id) {
                    debug!(id, "remote cancelled call");
                    task.abort();
                }
            }
        }
    }

    fn settle(&mut self, id: RequestId, outcome: Result<Value>) {
        match self.pending.remove(&id) {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => trace!(id, "response for unknown request dropped"),
        }
    }

    fn dispatch(&mut self, id: RequestId, name: String, mut args: Vec<Value>) {
        if self.running.contains_key(&id) {
            warn!(id, name = %name, "duplicate request id ignored");
            return;
        }
        if let Err(pointer) = normalize_error_args(&mut args) {
            debug!(id, name = %name, %pointer, "malformed error argument");
            let _ = self.send(&Envelope::Error {
                id,
                error: RpcError::InvalidErrorArg(pointer).to_serialized(),
            });
            return;
        }
        let handler = match self.registry.resolve(&name) {
            Ok(handler) => handler,
            Err(err) => {
                debug!(id, name = %name, "method not found");
                let _ = self.send(&Envelope::Error {
                    id,
                    error: err.to_serialized(),
                });
                return;
            }
        };

        let task = tokio::spawn(handler(args));
        self.running.insert(id, task.abort_handle());

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => {
                    warn!(id, name = %name, "rpc handler panicked");
                    Err(SerializedError::new(HANDLER_PANIC, panic_message(err)))
                }
                Err(_) => return,
            };
            let _ = completions.send((id, outcome));
        });
    }

    fn handle_completion(&mut self, id: RequestId, outcome: MethodResult) {
        if self.running.remove(&id).is_none() {
            trace!(id, "completion for cancelled call dropped");
            return;
        }
        let envelope = match outcome {
            Ok(result) => Envelope::Result { id, result },
            Err(error) => Envelope::Error { id, error },
        };
        if let Err(err) = self.send(&envelope) {
            debug!(id, error = %err, "could not deliver response");
        }
    }

    fn send(&self, envelope: &Envelope) -> Result<()> {
        let payload = envelope.to_payload()?;
        self.sender.send(payload).map_err(|err| match err {
            rpcmux_mux::MuxError::ChannelClosed(id) => RpcError::ChannelClosed(id),
            other => RpcError::Mux(other),
        })
    }
}

fn panic_message(err: JoinError) -> String {
    let panic = err.into_panic();
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}
