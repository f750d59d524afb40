//! In-process topic routing
//!
//! Many listeners may share one broker subscription. The router keeps a
//! reference count per filter and tells the transport when the first
//! listener arrives and the last one leaves.
//!
//! Each route handles its messages one at a time, in the order they were
//! dispatched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tracing::trace;

/// A message delivered to a subscription callback
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    /// The filter this message matched
    pub subscribed_topic: String,
}

pub type MessageCallback = Arc<dyn Fn(ReceiveMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`MessageCallback`]
pub fn message_callback<F, Fut>(f: F) -> MessageCallback
where
    F: Fn(ReceiveMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| f(msg).boxed())
}

/// Whether `topic` matches `filter` (`+` one level, `#` the rest)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Route {
    id: u64,
    callback: MessageCallback,
    /// Started on first delivery; dropping the route ends the worker once
    /// its queue is drained
    queue: OnceLock<mpsc::UnboundedSender<ReceiveMessage>>,
}

impl Route {
    fn deliver(&self, msg: ReceiveMessage) {
        let queue = self
            .queue
            .get_or_init(|| spawn_route_worker(self.callback.clone()));
        if queue.send(msg).is_err() {
            trace!(id = self.id, "Route worker gone, message dropped");
        }
    }
}

fn spawn_route_worker(callback: MessageCallback) -> mpsc::UnboundedSender<ReceiveMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ReceiveMessage>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            callback(msg).await;
        }
    });
    tx
}

#[derive(Default)]
pub struct TopicRouter {
    routes: DashMap<String, Vec<Route>>,
    next_id: AtomicU64,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `filter`
    ///
    /// Returns the route id and whether this is the filter's first route.
    pub fn add(&self, filter: &str, callback: MessageCallback) -> (u64, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut routes = self.routes.entry(filter.to_string()).or_default();
        let first = routes.is_empty();
        routes.push(Route {
            id,
            callback,
            queue: OnceLock::new(),
        });
        trace!(filter, id, first, "Added route");
        (id, first)
    }

    /// Drop route `id` from `filter`
    ///
    /// Returns true when the filter has no routes left.
    pub fn remove(&self, filter: &str, id: u64) -> bool {
        match self.routes.get_mut(filter) {
            Some(mut routes) => routes.retain(|r| r.id != id),
            None => return false,
        }
        let last = self
            .routes
            .remove_if(filter, |_, routes| routes.is_empty())
            .is_some();
        trace!(filter, id, last, "Removed route");
        last
    }

    /// Queue the message on every route whose filter matches `topic`
    ///
    /// Returns how many routes it was queued on.
    pub fn dispatch(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> usize {
        let mut delivered = 0;
        for entry in self.routes.iter() {
            if !topic_matches(entry.key(), topic) {
                continue;
            }
            for route in entry.value() {
                route.deliver(ReceiveMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    qos,
                    retain,
                    subscribed_topic: entry.key().clone(),
                });
                delivered += 1;
            }
        }
        delivered
    }

    /// Filters with at least one route
    pub fn filters(&self) -> Vec<String> {
        self.routes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn route_count(&self, filter: &str) -> usize {
        self.routes.get(filter).map(|r| r.len()).unwrap_or(0)
    }
}
