//! Named signal dispatcher
//!
//! A signal is a plain string (`mqtt_discovery_done_sensor_bla`). Listeners
//! connect an async callback to a signal and get back a [`Disconnect`]
//! handle. [`Dispatcher::send`] is fire-and-forget: every connected callback
//! is spawned as its own task, so a sender never waits on a listener.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::trace;

/// Future returned by a signal callback
pub type SignalFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback connected to a signal
pub type SignalCallback<T> = Arc<dyn Fn(T) -> SignalFuture + Send + Sync>;

struct Listener<T> {
    id: u64,
    callback: SignalCallback<T>,
}

/// Dispatcher for signals carrying a payload of type `T`
pub struct Dispatcher<T> {
    signals: DashMap<String, Vec<Listener<T>>>,
    next_id: AtomicU64,
}

impl<T> Dispatcher<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            signals: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Connect `callback` to `signal`
    ///
    /// The listener stays connected until [`Disconnect::disconnect`] is
    /// called; dropping the handle does not disconnect.
    pub fn connect<F, Fut>(self: &Arc<Self>, signal: impl Into<String>, callback: F) -> Disconnect
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let signal = signal.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: SignalCallback<T> =
            Arc::new(move |payload| -> SignalFuture { Box::pin(callback(payload)) });

        trace!(signal = %signal, id, "Connecting signal listener");
        self.signals
            .entry(signal.clone())
            .or_default()
            .push(Listener { id, callback });

        let dispatcher: Weak<Self> = Arc::downgrade(self);
        Disconnect::new(move || {
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.remove_listener(&signal, id);
            }
        })
    }

    fn remove_listener(&self, signal: &str, id: u64) {
        let now_empty = match self.signals.get_mut(signal) {
            Some(mut listeners) => {
                listeners.retain(|l| l.id != id);
                listeners.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.signals.remove_if(signal, |_, listeners| listeners.is_empty());
        }
        trace!(signal = %signal, id, "Disconnected signal listener");
    }

    /// Send `payload` to every listener of `signal`
    ///
    /// Must be called from within a tokio runtime.
    pub fn send(&self, signal: &str, payload: T) {
        // Clone the callbacks out so no map guard is held while spawning
        let callbacks: Vec<SignalCallback<T>> = match self.signals.get(signal) {
            Some(listeners) => listeners.iter().map(|l| l.callback.clone()).collect(),
            None => return,
        };
        trace!(signal = %signal, listeners = callbacks.len(), "Sending signal");
        for callback in callbacks {
            tokio::spawn(callback(payload.clone()));
        }
    }

    /// Number of listeners connected to `signal`
    pub fn listener_count(&self, signal: &str) -> usize {
        self.signals.get(signal).map(|l| l.len()).unwrap_or(0)
    }

    /// Whether anything is connected to `signal`
    pub fn has_listeners(&self, signal: &str) -> bool {
        self.listener_count(signal) > 0
    }
}

/// Handle that disconnects a listener or cancels a subscription
///
/// Calling [`Disconnect::disconnect`] more than once is a no-op.
pub struct Disconnect {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Disconnect {
    pub fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// A handle that does nothing
    pub fn noop() -> Self {
        Self { remove: None }
    }

    pub fn disconnect(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.remove.is_some()
    }
}

impl std::fmt::Debug for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disconnect")
            .field("connected", &self.is_connected())
            .finish()
    }
}
