//! Client-side connection lifecycle.
//!
//! ```text
//! Idle ─connect()─▶ Connecting ─▶ Connected ─loss─▶ Reconnecting ─▶ Connected
//!                        │                                │
//!                        └─attempts spent─▶ Idle          └─dispose()─▶ Closed
//! ```
//!
//! A supervisor task owns the transport: it connects with backoff, starts a
//! [`Multiplexer`], re-opens every path used so far, and waits for the
//! multiplexer to stop. Calls go through [`ConnectionManager::call`] or a
//! proxy from [`ConnectionManager::get_proxy`] and pick up whichever
//! multiplexer is current.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use rpcmux_mux::{Multiplexer, MuxError};
use rpcmux_rpc::{
    get_proxy, CallTarget, FromProxy, ProxyIdentifier, RpcError, RpcPeer, ServiceRegistry,
};
use rpcmux_transport::{BoxFuture, Disposable, Emitter, TransportDriver};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::ConnectionConfig;
use crate::connector::Connector;
use crate::error::{ConnectionError, Result};
use crate::server::serve_incoming;

/// Where a [`ConnectionManager`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Session {
    generation: u64,
    mux: Multiplexer,
    peers: HashMap<String, RpcPeer>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    registry: Arc<ServiceRegistry>,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    known_paths: Mutex<BTreeSet<String>>,
    reconnected: Emitter<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    open_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    /// Move to `next` unless the manager has been disposed.
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == next {
                return false;
            }
            debug!(from = %state, to = %next, "connection state");
            *state = next;
            true
        })
    }

    fn is_disposed(&self) -> bool {
        *self.state.borrow() == ConnectionState::Closed
    }
}

/// A reconnecting RPC client over one logical connection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// `registry` holds the services this side exposes to the remote end on
    /// channels the remote opens.
    pub fn new(
        connector: impl Connector,
        registry: Arc<ServiceRegistry>,
        config: ConnectionConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                connector: Arc::new(connector),
                registry,
                config,
                state,
                session: Mutex::new(None),
                known_paths: Mutex::new(BTreeSet::new()),
                reconnected: Emitter::new(),
                supervisor: Mutex::new(None),
                open_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Establish the connection.
    ///
    /// Resolves once the first transport is up, or fails with
    /// [`ConnectionError::ConnectFailed`] after
    /// [`crate::ReconnectConfig::max_attempts`] attempts, leaving the
    /// manager `Idle`. Calling it again while connecting or connected waits
    /// for the same connection.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(ConnectionError::Disposed);
        }

        let first = {
            let mut supervisor = self
                .inner
                .supervisor
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if supervisor.is_some() {
                None
            } else {
                let (first_tx, first_rx) = oneshot::channel();
                self.inner.transition(ConnectionState::Connecting);
                info!(remote = %self.inner.connector.describe(), "connecting");
                *supervisor = Some(tokio::spawn(supervise(
                    Arc::downgrade(&self.inner),
                    self.inner.state.subscribe(),
                    first_tx,
                )));
                Some(first_rx)
            }
        };

        match first {
            Some(first) => first.await.unwrap_or(Err(ConnectionError::Disposed)),
            None => self.wait_settled().await,
        }
    }

    async fn wait_settled(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let settled = state
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected | ConnectionState::Idle | ConnectionState::Closed
                )
            })
            .await
            .map(|state| *state);
        match settled {
            Ok(ConnectionState::Connected) => Ok(()),
            Ok(ConnectionState::Idle) => Err(RpcError::ConnectionLost.into()),
            _ => Err(ConnectionError::Disposed),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Register a callback fired each time the connection is re-established
    /// after a loss. Not fired for the first connect.
    pub fn on_did_reconnect(&self, callback: impl Fn() + Send + Sync + 'static) -> Disposable {
        self.inner.reconnected.subscribe(move |_: &()| callback())
    }

    /// Tear the connection down for good. Outstanding calls fail with
    /// `ConnectionLost`; later calls fail immediately.
    pub async fn dispose(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closed;
            true
        });
        if !changed {
            return;
        }
        info!(remote = %self.inner.connector.describe(), "connection disposed");

        let session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.mux.shutdown().await;
        }

        let supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
    }

    /// Call `service_id#method` on the channel for `path`, opening the
    /// channel on first use.
    pub async fn call(
        &self,
        path: &str,
        service_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> rpcmux_rpc::Result<Value> {
        let peer = self.peer_for(path).await?;
        peer.call(service_id, method, args).await
    }

    /// Typed client for `ident`, routed over the channel for its path.
    ///
    /// The proxy survives reconnects.
    pub fn get_proxy<T: FromProxy>(&self, ident: &ProxyIdentifier<T>) -> T {
        let target = PathTarget {
            manager: self.clone(),
            path: ident.path(),
        };
        get_proxy(Arc::new(target), ident)
    }

    /// Paths opened so far; re-opened after every reconnect.
    pub fn known_paths(&self) -> Vec<String> {
        self.inner
            .known_paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    async fn peer_for(&self, path: &str) -> rpcmux_rpc::Result<RpcPeer> {
        let deadline = Instant::now() + self.inner.config.reconnect_queue_timeout;
        loop {
            self.wait_connected(deadline).await?;

            let guard = self.inner.open_lock.lock().await;
            let current = {
                let session = self
                    .inner
                    .session
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match session.as_ref() {
                    Some(session) if !session.mux.is_closed() => {
                        if let Some(peer) =
                            session.peers.get(path).filter(|peer| !peer.is_closed())
                        {
                            return Ok(peer.clone());
                        }
                        Ok((session.generation, session.mux.clone()))
                    }
                    // The multiplexer stopped but the supervisor has not
                    // moved to `Reconnecting` yet.
                    stale => Err(stale.map(|session| session.generation)),
                }
            };
            let (generation, mux) = match current {
                Ok(current) => current,
                Err(stale) => {
                    drop(guard);
                    self.wait_replaced(stale, deadline).await?;
                    continue;
                }
            };

            let channel = mux.open_channel(path).await.map_err(mux_error)?;
            let peer = RpcPeer::spawn(
                channel,
                Arc::clone(&self.inner.registry),
                self.inner.config.rpc.clone(),
            );
            self.inner
                .known_paths
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(path.to_owned());

            let mut session = self
                .inner
                .session
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(session) = session
                .as_mut()
                .filter(|session| session.generation == generation)
            {
                session.peers.insert(path.to_owned(), peer.clone());
            }
            return Ok(peer);
        }
    }

    fn current_generation(&self) -> Option<u64> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.generation)
    }

    /// Wait until the session seen as `stale` has been replaced or the state
    /// has left `Connected`.
    async fn wait_replaced(&self, stale: Option<u64>, deadline: Instant) -> rpcmux_rpc::Result<()> {
        let mut state = self.inner.state.subscribe();
        if self.current_generation() != stale {
            return Ok(());
        }
        let left = state.wait_for(|state| *state != ConnectionState::Connected);
        let moved = matches!(tokio::time::timeout_at(deadline, left).await, Ok(Ok(_)));
        if moved {
            Ok(())
        } else {
            Err(RpcError::ConnectionLost)
        }
    }

    /// Wait for `Connected`, at most until `deadline`.
    async fn wait_connected(&self, deadline: Instant) -> rpcmux_rpc::Result<()> {
        let mut state = self.inner.state.subscribe();
        let current = *state.borrow();
        match current {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Idle | ConnectionState::Closed => {
                return Err(RpcError::ConnectionLost)
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {}
        }

        let wait = state.wait_for(|state| {
            matches!(
                state,
                ConnectionState::Connected | ConnectionState::Idle | ConnectionState::Closed
            )
        });
        let connected = match tokio::time::timeout_at(deadline, wait).await {
            Ok(Ok(state)) => *state == ConnectionState::Connected,
            Ok(Err(_)) => false,
            Err(_) => {
                let limit = self.inner.config.reconnect_queue_timeout;
                debug!(?limit, "call not connected in time");
                false
            }
        };
        if connected {
            Ok(())
        } else {
            Err(RpcError::ConnectionLost)
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.inner.connector.describe())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn mux_error(err: MuxError) -> RpcError {
    match err {
        MuxError::TransportLost | MuxError::Shutdown => RpcError::ConnectionLost,
        MuxError::ChannelClosed(id) => RpcError::ChannelClosed(id),
        other => RpcError::Mux(other),
    }
}

struct PathTarget {
    manager: ConnectionManager,
    path: &'static str,
}

impl CallTarget for PathTarget {
    fn call(
        &self,
        service_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'static, rpcmux_rpc::Result<Value>> {
        let manager = self.manager.clone();
        let path = self.path;
        let service_id = service_id.to_owned();
        let method = method.to_owned();
        Box::pin(async move { manager.call(path, &service_id, &method, args).await })
    }
}

async fn until_disposed(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state
        .wait_for(|state| *state == ConnectionState::Closed)
        .await;
}

/// Connect with backoff. `Ok(None)` means the manager went away meanwhile.
async fn connect_with_backoff(
    connector: &dyn Connector,
    mut backoff: Backoff,
    state: &mut watch::Receiver<ConnectionState>,
) -> Result<Option<Arc<dyn TransportDriver>>> {
    loop {
        let attempt = tokio::select! {
            attempt = connector.connect() => attempt,
            () = until_disposed(state) => return Ok(None),
        };
        let err = match attempt {
            Ok(driver) => return Ok(Some(driver)),
            Err(err) => err,
        };

        let delay = backoff.next_delay();
        if backoff.exhausted() {
            return Err(ConnectionError::ConnectFailed {
                attempts: backoff.attempts(),
                source: err,
            });
        }
        warn!(
            remote = %connector.describe(),
            attempt = backoff.attempts(),
            ?delay,
            error = %err,
            "connect failed, retrying"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = until_disposed(state) => return Ok(None),
        }
    }
}

async fn supervise(
    inner: Weak<Inner>,
    mut state: watch::Receiver<ConnectionState>,
    first: oneshot::Sender<Result<()>>,
) {
    let mut first = Some(first);
    let mut generation = 0u64;

    loop {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let connector = Arc::clone(&strong.connector);
        let mut reconnect = strong.config.reconnect.clone();
        if first.is_none() {
            reconnect.max_attempts = None;
        }
        drop(strong);

        let driver = match connect_with_backoff(connector.as_ref(), Backoff::new(reconnect), &mut state).await {
            Ok(Some(driver)) => driver,
            Ok(None) => return,
            Err(err) => {
                warn!(remote = %connector.describe(), error = %err, "giving up");
                if let Some(strong) = inner.upgrade() {
                    strong.transition(ConnectionState::Idle);
                    strong
                        .supervisor
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                }
                if let Some(first) = first.take() {
                    let _ = first.send(Err(err));
                }
                return;
            }
        };

        let Some(strong) = inner.upgrade() else {
            driver.close();
            return;
        };
        generation += 1;
        let (mux, incoming) = Multiplexer::start(driver, strong.config.mux.clone());
        tokio::spawn(serve_incoming(
            incoming,
            Arc::clone(&strong.registry),
            strong.config.rpc.clone(),
        ));

        let paths: Vec<String> = strong
            .known_paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        let mut peers = HashMap::new();
        for path in paths {
            let reopened = tokio::select! {
                reopened = mux.open_channel(path.as_str()) => reopened,
                () = until_disposed(&mut state) => {
                    drop(strong);
                    mux.shutdown().await;
                    return;
                }
            };
            match reopened {
                Ok(channel) => {
                    let peer = RpcPeer::spawn(
                        channel,
                        Arc::clone(&strong.registry),
                        strong.config.rpc.clone(),
                    );
                    peers.insert(path, peer);
                }
                Err(err) => warn!(path = %path, error = %err, "re-open failed"),
            }
        }

        let installed = {
            let mut session = strong.session.lock().unwrap_or_else(PoisonError::into_inner);
            if strong.is_disposed() {
                false
            } else {
                *session = Some(Session {
                    generation,
                    mux: mux.clone(),
                    peers,
                });
                true
            }
        };
        if !installed {
            drop(strong);
            mux.shutdown().await;
            return;
        }
        strong.transition(ConnectionState::Connected);
        info!(
            remote = %connector.describe(),
            transport = mux.transport_name(),
            generation,
            "connected"
        );
        if let Some(first) = first.take() {
            let _ = first.send(Ok(()));
        }
        if generation > 1 {
            strong.reconnected.fire(&());
        }
        drop(strong);

        tokio::select! {
            reason = mux.closed() => {
                warn!(remote = %connector.describe(), ?reason, "connection lost");
            }
            () = until_disposed(&mut state) => {
                mux.shutdown().await;
                return;
            }
        }

        let Some(strong) = inner.upgrade() else {
            return;
        };
        {
            let mut session = strong.session.lock().unwrap_or_else(PoisonError::into_inner);
            if session
                .as_ref()
                .is_some_and(|session| session.generation == generation)
            {
                session.take();
            }
        }
        if !strong.transition(ConnectionState::Reconnecting) {
            return;
        }
    }
}
