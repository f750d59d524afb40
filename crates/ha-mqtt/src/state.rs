//! Per-run discovery state
//!
//! Created by [`DiscoveryEngine::async_start`](crate::DiscoveryEngine::async_start)
//! and torn down by `async_stop`. Nothing here outlives a run.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use ha_config_entries::ConfigEntry;
use ha_event_bus::Disconnect;
use tokio::task::JoinHandle;

use crate::client::Subscription;
use crate::entity::MqttPlatform;
use crate::payload::NormalizedPayload;
use crate::topic::DiscoveryHash;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Payloads waiting for the in-flight one of the same hash
///
/// Arrivals go to the front and replay takes from the back, so the newest
/// payload is the last one applied.
pub(crate) struct PendingDiscovery {
    listener: Disconnect,
    queue: VecDeque<NormalizedPayload>,
}

/// What to do with a freshly received payload
pub(crate) enum Admission {
    /// Another payload for the hash is in flight; this one was queued
    Queued,
    /// Route this payload now
    Route(NormalizedPayload),
}

pub(crate) struct DiscoveryState {
    pub(crate) prefix: String,
    pub(crate) entry: ConfigEntry,
    already_discovered: DashSet<DiscoveryHash>,
    pending: DashMap<DiscoveryHash, PendingDiscovery>,
    /// `"<component>.<integration>"` pairs whose platform is set up
    pub(crate) setup_keys: tokio::sync::Mutex<HashSet<String>>,
    subscriptions: Mutex<Vec<Subscription>>,
    listeners: Mutex<Vec<Disconnect>>,
    platforms: Mutex<Vec<Arc<MqttPlatform>>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryState {
    pub(crate) fn new(prefix: impl Into<String>, entry: ConfigEntry) -> Self {
        Self {
            prefix: prefix.into(),
            entry,
            already_discovered: DashSet::new(),
            pending: DashMap::new(),
            setup_keys: tokio::sync::Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            platforms: Mutex::new(Vec::new()),
            cleanup_task: Mutex::new(None),
        }
    }

    pub(crate) fn is_already_discovered(&self, hash: &DiscoveryHash) -> bool {
        self.already_discovered.contains(hash)
    }

    pub(crate) fn mark_discovered(&self, hash: DiscoveryHash) {
        self.already_discovered.insert(hash);
    }

    pub(crate) fn clear_discovered(&self, hash: &DiscoveryHash) {
        self.already_discovered.remove(hash);
    }

    pub(crate) fn discovered_count(&self) -> usize {
        self.already_discovered.len()
    }

    /// Queue `payload` behind an in-flight one, or admit it for routing
    ///
    /// An admitted payload that will emit a signal gets a pending entry,
    /// with the listener from `make_listener` waiting for its done signal.
    /// Check and insert happen under the map's shard lock.
    pub(crate) fn admit(
        &self,
        hash: &DiscoveryHash,
        payload: NormalizedPayload,
        make_listener: impl FnOnce() -> Disconnect,
    ) -> Admission {
        match self.pending.entry(hash.clone()) {
            Entry::Occupied(mut pending) => {
                pending.get_mut().queue.push_front(payload);
                Admission::Queued
            }
            Entry::Vacant(vacant) => {
                if self.is_already_discovered(hash) || !payload.is_empty() {
                    vacant.insert(PendingDiscovery {
                        listener: make_listener(),
                        queue: VecDeque::new(),
                    });
                }
                Admission::Route(payload)
            }
        }
    }

    /// Next queued payload for `hash`
    ///
    /// When the queue is empty the pending entry is removed and its done
    /// listener disconnected.
    pub(crate) fn take_next(&self, hash: &DiscoveryHash) -> Option<NormalizedPayload> {
        let mut drained = match self.pending.entry(hash.clone()) {
            Entry::Occupied(mut pending) => {
                if let Some(payload) = pending.get_mut().queue.pop_back() {
                    return Some(payload);
                }
                pending.remove()
            }
            Entry::Vacant(_) => return None,
        };
        drained.listener.disconnect();
        None
    }

    pub(crate) fn is_pending(&self, hash: &DiscoveryHash) -> bool {
        self.pending.contains_key(hash)
    }

    pub(crate) fn add_subscription(&self, subscription: Subscription) {
        lock(&self.subscriptions).push(subscription);
    }

    pub(crate) fn add_listener(&self, listener: Disconnect) {
        lock(&self.listeners).push(listener);
    }

    pub(crate) fn add_platform(&self, platform: Arc<MqttPlatform>) {
        lock(&self.platforms).push(platform);
    }

    pub(crate) fn set_cleanup_task(&self, task: JoinHandle<()>) {
        if let Some(previous) = lock(&self.cleanup_task).replace(task) {
            previous.abort();
        }
    }

    /// Cancel every subscription, listener and task of this run
    pub(crate) fn teardown(&self) {
        for mut subscription in lock(&self.subscriptions).drain(..) {
            subscription.unsubscribe();
        }

        let hashes: Vec<DiscoveryHash> = self.pending.iter().map(|p| p.key().clone()).collect();
        for hash in hashes {
            if let Some((_, mut pending)) = self.pending.remove(&hash) {
                pending.listener.disconnect();
            }
        }

        for mut listener in lock(&self.listeners).drain(..) {
            listener.disconnect();
        }
        for platform in lock(&self.platforms).drain(..) {
            platform.shutdown();
        }
        if let Some(task) = lock(&self.cleanup_task).take() {
            task.abort();
        }
        self.already_discovered.clear();
    }
}
