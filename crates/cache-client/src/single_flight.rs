//! Single-flight memoized async factory.
//!
//! Each key owns a slot that is absent, in progress, or ready. Concurrent
//! callers for the same key await the one in-progress initialization instead
//! of racing. A failed initialization leaves the slot empty, so the next
//! caller retries; failures are never cached.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// Keyed single-flight cache.
pub struct SingleFlight<K, V> {
    slots: RwLock<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Return the value for `key`, running `init` if no value exists yet.
    ///
    /// At most one `init` runs per key at a time.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: &K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(key).await;
        slot.get_or_try_init(init).await.cloned()
    }

    /// Return the value for `key` if it is ready.
    pub async fn get(&self, key: &K) -> Option<V> {
        let slots = self.slots.read().await;
        slots.get(key).and_then(|slot| slot.get().cloned())
    }

    /// Detach the slot for `key`, returning its value if it was ready.
    ///
    /// An initialization still in flight completes into the detached slot and
    /// is not visible to later callers.
    pub async fn remove(&self, key: &K) -> Option<V> {
        let mut slots = self.slots.write().await;
        slots.remove(key).and_then(|slot| slot.get().cloned())
    }

    /// Detach the slot for `key` only if its ready value satisfies `predicate`.
    pub async fn remove_if<P>(&self, key: &K, predicate: P) -> Option<V>
    where
        P: FnOnce(&V) -> bool,
    {
        let mut slots = self.slots.write().await;
        let matches = slots
            .get(key)
            .and_then(|slot| slot.get())
            .is_some_and(predicate);
        if matches {
            slots.remove(key).and_then(|slot| slot.get().cloned())
        } else {
            None
        }
    }

    /// Detach every slot, returning the ready values.
    pub async fn drain(&self) -> Vec<(K, V)> {
        let mut slots = self.slots.write().await;
        slots
            .drain()
            .filter_map(|(key, slot)| slot.get().cloned().map(|value| (key, value)))
            .collect()
    }

    /// Number of ready values.
    pub async fn len(&self) -> usize {
        let slots = self.slots.read().await;
        slots.values().filter(|slot| slot.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn slot(&self, key: &K) -> Arc<OnceCell<V>> {
        // Check existing slots first
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(key) {
                return Arc::clone(slot);
            }
        }

        let mut slots = self.slots.write().await;
        Arc::clone(
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }
}
