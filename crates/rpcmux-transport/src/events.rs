use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::error::TransportError;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by every callback registration.
///
/// Calling [`Disposable::dispose`] unregisters the callback. Dropping the
/// handle without disposing leaves the callback registered for the lifetime
/// of its source.
#[must_use = "keep the Disposable to be able to unregister the callback"]
pub struct Disposable {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Disposable {
    /// Wrap an unregister action.
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// A disposable that does nothing.
    pub fn noop() -> Self {
        Self { dispose: None }
    }

    /// Unregister the callback. Calling this more than once is a no-op.
    pub fn dispose(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }

    /// Whether [`Disposable::dispose`] has already run.
    pub fn is_disposed(&self) -> bool {
        self.dispose.is_none()
    }
}

impl std::fmt::Debug for Disposable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// A list of callbacks for one event type.
pub struct Emitter<T> {
    listeners: Arc<Mutex<Vec<(u64, Listener<T>)>>>,
    next_id: AtomicU64,
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Disposable {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));

        let listeners = Arc::downgrade(&self.listeners);
        Disposable::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(existing, _)| *existing != id);
            }
        })
    }

    /// Invoke every registered callback.
    ///
    /// The listener list is snapshotted first, so callbacks may register or
    /// dispose listeners without deadlocking.
    pub fn fire(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(value);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener registry shared by every driver implementation.
///
/// Drivers call the `fire_*` methods from their I/O paths; consumers register
/// through [`crate::TransportDriver`]. Close fires at most once.
///
/// Messages that arrive before the first message listener is registered are
/// held back and replayed, in order, to that listener.
pub struct DriverEvents {
    message: Emitter<Bytes>,
    close: Emitter<()>,
    error: Emitter<TransportError>,
    closed: AtomicBool,
    // Serializes the closed transition against close registration.
    close_state: Mutex<bool>,
    // `Some` until the first message listener arrives.
    backlog: Mutex<Option<Vec<Bytes>>>,
}

impl DriverEvents {
    pub fn new() -> Self {
        Self {
            message: Emitter::new(),
            close: Emitter::new(),
            error: Emitter::new(),
            closed: AtomicBool::new(false),
            close_state: Mutex::new(false),
            backlog: Mutex::new(Some(Vec::new())),
        }
    }

    /// Register a message callback. The first registration receives every
    /// message that arrived before it.
    pub fn on_message(&self, listener: impl Fn(Bytes) + Send + Sync + 'static) -> Disposable {
        let listener = Arc::new(listener);
        let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
        let subscribed = Arc::clone(&listener);
        let registration = self
            .message
            .subscribe(move |message: &Bytes| (*subscribed)(message.clone()));
        // Replay under the backlog lock so concurrent deliveries queue behind it.
        if let Some(pending) = backlog.take() {
            for message in pending {
                (*listener)(message);
            }
        }
        registration
    }

    /// Register a close callback. If the driver is already closed the
    /// callback runs immediately.
    pub fn on_close(&self, listener: impl Fn() + Send + Sync + 'static) -> Disposable {
        let closed = self
            .close_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *closed {
            drop(closed);
            listener();
            return Disposable::noop();
        }
        self.close.subscribe(move |_: &()| listener())
    }

    pub fn on_error(
        &self,
        listener: impl Fn(&TransportError) + Send + Sync + 'static,
    ) -> Disposable {
        self.error.subscribe(listener)
    }

    /// Deliver one inbound message. Ignored once the driver is closed.
    pub fn fire_message(&self, message: Bytes) {
        if self.is_closed() {
            return;
        }
        {
            let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(pending) = backlog.as_mut() {
                pending.push(message);
                return;
            }
        }
        self.message.fire(&message);
    }

    pub fn fire_error(&self, error: &TransportError) {
        self.error.fire(error);
    }

    /// Mark the driver closed and notify close listeners. Returns `false` if
    /// the driver was already closed.
    pub fn fire_close(&self) -> bool {
        {
            let mut closed = self
                .close_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *closed {
                return false;
            }
            *closed = true;
            self.closed.store(true, Ordering::Release);
        }
        self.close.fire(&());
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for DriverEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn dispose_unregisters_listener() {
        let emitter = Emitter::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let mut registration = emitter.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        emitter.fire(&1);
        registration.dispose();
        registration.dispose();
        emitter.fire(&2);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
        assert!(registration.is_disposed());
    }

    #[test]
    fn close_fires_once() {
        let events = DriverEvents::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let _registration = events.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(events.fire_close());
        assert!(!events.fire_close());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_close_listener_runs_immediately() {
        let events = DriverEvents::new();
        events.fire_close();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let registration = events.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registration.is_disposed());
    }

    #[test]
    fn messages_after_close_are_ignored() {
        let events = DriverEvents::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&received);
        let _registration = events.on_message(move |message| {
            sink.lock().unwrap().push(message);
        });

        events.fire_message(Bytes::from_static(b"one"));
        events.fire_close();
        events.fire_message(Bytes::from_static(b"two"));

        assert_eq!(
            received.lock().unwrap().as_slice(),
            &[Bytes::from_static(b"one")]
        );
    }

    #[test]
    fn messages_before_first_listener_are_replayed_in_order() {
        let events = DriverEvents::new();
        events.fire_message(Bytes::from_static(b"early-1"));
        events.fire_message(Bytes::from_static(b"early-2"));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let _registration = events.on_message(move |message| {
            sink.lock().unwrap().push(message);
        });
        events.fire_message(Bytes::from_static(b"late"));

        assert_eq!(
            received.lock().unwrap().as_slice(),
            &[
                Bytes::from_static(b"early-1"),
                Bytes::from_static(b"early-2"),
                Bytes::from_static(b"late"),
            ]
        );
    }

    #[test]
    fn close_racing_registration_is_never_lost() {
        for _ in 0..500 {
            let events = Arc::new(DriverEvents::new());
            let hits = Arc::new(AtomicUsize::new(0));

            let closer = {
                let events = Arc::clone(&events);
                std::thread::spawn(move || {
                    events.fire_close();
                })
            };
            let counter = Arc::clone(&hits);
            let _registration = events.on_close(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            closer.join().unwrap();

            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn listener_may_dispose_itself_while_firing() {
        let emitter = Arc::new(Emitter::<u32>::new());
        let slot: Arc<Mutex<Option<Disposable>>> = Arc::new(Mutex::new(None));

        let inner_slot = Arc::clone(&slot);
        let registration = emitter.subscribe(move |_| {
            if let Some(mut registration) = inner_slot.lock().unwrap().take() {
                registration.dispose();
            }
        });
        *slot.lock().unwrap() = Some(registration);

        emitter.fire(&7);
        assert_eq!(emitter.listener_count(), 0);
    }
}
