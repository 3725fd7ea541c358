//! Per-target state with one lock per key.
//!
//! The outer map lock is held only long enough to fetch or create a slot, so
//! work on unrelated targets never serialises behind a single mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;

/// Map from target id to an independently locked value.
pub struct KeyedState<V> {
    slots: Mutex<HashMap<i64, Arc<AsyncMutex<V>>>>,
}

impl<V: Default> KeyedState<V> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The slot for `key`, created with `V::default()` on first use.
    pub fn slot(&self, key: i64) -> Arc<AsyncMutex<V>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key).or_default().clone()
    }

    /// The slot for `key` if one exists. Never creates.
    pub fn existing(&self, key: i64) -> Option<Arc<AsyncMutex<V>>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(&key).cloned()
    }

    /// Keep only the slots whose key passes `keep`.
    pub fn retain(&self, keep: impl Fn(i64) -> bool) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| keep(*key));
    }

    /// Drop every slot. Holders of a previously fetched slot keep their copy.
    pub fn clear(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<V: Default> Default for KeyedState<V> {
    fn default() -> Self {
        Self::new()
    }
}
