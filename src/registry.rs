// Single source of truth for outstanding messages, keyed by handle.

use crate::message::{Message, MessageHandle};
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

/// Concurrent handle-to-message map with a broadcast condition.
///
/// Reads (lookup, snapshot iteration) take the map's shared lock; inserts
/// and removals take it exclusively. The broadcast condition is notified by
/// the parser whenever any message changes status, which is what wakes
/// blocked callers and the transfer planner.
#[derive(Default)]
pub struct MessageRegistry {
    messages: RwLock<BTreeMap<MessageHandle, Arc<Message>>>,
    wait_lock: Mutex<()>,
    broadcast: Condvar,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, msg: Arc<Message>) {
        let mut map = self.messages.write().unwrap();
        map.insert(msg.handle(), msg);
    }

    pub fn find(&self, handle: MessageHandle) -> Option<Arc<Message>> {
        let map = self.messages.read().unwrap();
        map.get(&handle).cloned()
    }

    pub fn remove(&self, handle: MessageHandle) -> Option<Arc<Message>> {
        let mut map = self.messages.write().unwrap();
        map.remove(&handle)
    }

    pub fn clear(&self) {
        let mut map = self.messages.write().unwrap();
        map.clear();
    }

    pub fn contains(&self, handle: MessageHandle) -> bool {
        let map = self.messages.read().unwrap();
        map.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.messages.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live messages in handle order. The lock is released before the
    /// caller iterates, so long per-message work never blocks insertion.
    pub fn snapshot(&self) -> Vec<Arc<Message>> {
        let map = self.messages.read().unwrap();
        map.values().cloned().collect()
    }

    /// The incomplete message with the lowest handle, if any. Used by
    /// transports that deliver one response buffer per request to decide
    /// which message a buffer belongs to.
    pub fn oldest_incomplete(&self) -> Option<Arc<Message>> {
        let map = self.messages.read().unwrap();
        map.values().find(|m| !m.is_complete()).cloned()
    }

    /// Wakes everything blocked in [`wait_until`].
    ///
    /// [`wait_until`]: MessageRegistry::wait_until
    pub fn notify_all(&self) {
        let _guard = self.wait_lock.lock().unwrap();
        self.broadcast.notify_all();
    }

    /// Blocks until `pred` returns true. The predicate is re-evaluated on
    /// every broadcast and at least every `slice`, so state changes that
    /// race the wait are picked up on the next slice.
    pub fn wait_until<F: FnMut() -> bool>(&self, mut pred: F, slice: Duration) {
        loop {
            if pred() {
                return;
            }
            let guard = self.wait_lock.lock().unwrap();
            let _ = self.broadcast.wait_timeout(guard, slice).unwrap();
        }
    }
}
