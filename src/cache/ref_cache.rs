//! Reference-counted cache with single-flight loading
//!
//! Pages, records and MVCC entries are all pinned resources: a caller that
//! `get`s a key must `release` it, and the backing source is only asked to
//! evict once the last reference is gone. Concurrent `get`s of a key that is
//! still loading block until the one in-flight load publishes its result, so
//! a resource is never loaded twice.

use crate::{KeelError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;

/// Backing store for a [`RefCache`].
///
/// `load` returns `Ok(None)` for keys that simply do not exist (absence is
/// not an error). `evict` runs when the last reference to a cached value is
/// released and must persist any state the value still carries.
pub trait CacheSource<V> {
    fn load(&self, key: u64) -> Result<Option<V>>;
    fn evict(&self, key: u64, value: &V) -> Result<()>;
}

enum Slot<V> {
    /// A load for this key is in flight; waiters sleep on the condvar.
    Loading,
    Ready { value: Arc<V>, refs: usize },
}

pub struct RefCache<V, S> {
    source: S,

    /// Maximum number of cached resources; 0 means unbounded.
    capacity: usize,

    slots: Mutex<HashMap<u64, Slot<V>>>,

    /// Signalled whenever a Loading slot resolves.
    loaded: Condvar,
}

impl<V, S: CacheSource<V>> RefCache<V, S> {
    pub fn new(source: S, capacity: usize) -> Self {
        Self {
            source,
            capacity,
            slots: Mutex::new(HashMap::new()),
            loaded: Condvar::new(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetch a resource, loading it through the source on a miss.
    ///
    /// Fails with [`KeelError::CacheFull`] when the cache is at capacity and
    /// the key is not already cached.
    pub fn get(&self, key: u64) -> Result<Option<Arc<V>>> {
        let mut slots = self.slots.lock();
        loop {
            match slots.get_mut(&key) {
                Some(Slot::Ready { value, refs }) => {
                    *refs += 1;
                    return Ok(Some(value.clone()));
                }
                Some(Slot::Loading) => {
                    self.loaded.wait(&mut slots);
                }
                None => break,
            }
        }

        if self.capacity != 0 && slots.len() >= self.capacity {
            return Err(KeelError::CacheFull(self.capacity));
        }

        // Reserve the key so concurrent callers wait instead of loading the
        // same resource a second time.
        slots.insert(key, Slot::Loading);
        drop(slots);

        let outcome = self.source.load(key);

        let mut slots = self.slots.lock();
        let result = match outcome {
            Ok(Some(value)) => {
                let value = Arc::new(value);
                slots.insert(
                    key,
                    Slot::Ready {
                        value: value.clone(),
                        refs: 1,
                    },
                );
                Ok(Some(value))
            }
            Ok(None) => {
                slots.remove(&key);
                Ok(None)
            }
            Err(e) => {
                slots.remove(&key);
                Err(e)
            }
        };
        self.loaded.notify_all();
        result
    }

    /// Drop one reference; at zero the slot is removed and the source's
    /// eviction hook runs.
    pub fn release(&self, key: u64) -> Result<()> {
        let mut slots = self.slots.lock();
        let last_reference = match slots.get_mut(&key) {
            Some(Slot::Ready { refs, .. }) => {
                *refs -= 1;
                *refs == 0
            }
            _ => {
                debug_assert!(false, "release of uncached key {}", key);
                false
            }
        };
        if last_reference {
            if let Some(Slot::Ready { value, .. }) = slots.remove(&key) {
                self.source.evict(key, &value)?;
            }
        }
        Ok(())
    }

    /// Evict everything. Outstanding references at close time are a
    /// programming error; the resources are still flushed.
    pub fn close(&self) -> Result<()> {
        let mut slots = self.slots.lock();
        for (key, slot) in slots.drain() {
            if let Slot::Ready { value, refs } = slot {
                debug_assert_eq!(refs, 0, "key {} still pinned at close", key);
                self.source.evict(key, &value)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}
