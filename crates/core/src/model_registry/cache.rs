//! Single-flight load coordination.
//!
//! Unlike a polling loop against a `HashSet` marker, waiters for an
//! in-flight load register on a per-key [`tokio::sync::Notify`] and wake as
//! soon as the loader finishes, instead of spinning on a sleep interval.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

use super::config::ModelKey;
use super::handle::ModelHandle;

/// Tracks in-flight loads so concurrent `get_or_load` calls for the same
/// key coalesce into one loader invocation.
#[derive(Default)]
pub struct LoadCoordinator {
    in_flight: DashMap<ModelKey, Arc<Notify>>,
    /// The most recent load failure message for a key, so a waiter that
    /// wakes to find no cache entry can report why the load it was
    /// coalesced onto actually failed, instead of a generic message.
    last_failure: DashMap<ModelKey, String>,
}

impl LoadCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Either claim the right to load `key` (returns `true`, caller must
    /// call `finish`), or register to wait for the in-flight load (returns
    /// `false`, caller should await the returned notify then re-check the
    /// cache).
    pub fn claim_or_wait(&self, key: &ModelKey) -> (bool, Arc<Notify>) {
        if let Some(existing) = self.in_flight.get(key) {
            return (false, existing.clone());
        }
        let notify = Arc::new(Notify::new());
        match self.in_flight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (false, entry.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(notify.clone());
                (true, notify)
            }
        }
    }

    /// Signal that the load for `key` succeeded, waking every waiter.
    pub fn finish(&self, key: &ModelKey) {
        self.last_failure.remove(key);
        if let Some((_, notify)) = self.in_flight.remove(key) {
            notify.notify_waiters();
        }
    }

    /// Signal that the load for `key` failed with `message`, waking every
    /// waiter so they can retrieve it via [`Self::take_failure`].
    pub fn finish_with_error(&self, key: &ModelKey, message: impl Into<String>) {
        self.last_failure.insert(key.clone(), message.into());
        if let Some((_, notify)) = self.in_flight.remove(key) {
            notify.notify_waiters();
        }
    }

    /// Retrieve and clear the last recorded failure message for `key`, if
    /// any.
    pub fn take_failure(&self, key: &ModelKey) -> Option<String> {
        self.last_failure.remove(key).map(|(_, msg)| msg)
    }
}

/// A cache entry: the loaded model plus its reported memory footprint.
pub struct CacheEntry {
    pub handle: ModelHandle,
    pub memory_bytes: u64,
}
