//! Keyed object registries shared between the control thread and RT readers
//!
//! Each registry maps monotonically increasing `u64` keys to reference-counted
//! values. Lookups take a lock-free snapshot of the underlying map, so the
//! process callback and notification sinks can resolve keys without blocking
//! the control thread. Mutation copies the map and publishes the new version
//! through a [`SharedCell`]; superseded snapshots and removed values are
//! reclaimed by the session's collector once the last holder lets go.
//!
//! Keys start at 1 and are never reused, so a key held across a removal can
//! only ever miss, never alias a younger object.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use basedrop::{Handle, Shared, SharedCell};

use crate::types::{ClientKey, PortKey, RingKey, WorkerKey};

/// Key newtype usable as a registry index. Keys ride inside the published
/// snapshots, so they carry the snapshot's thread-safety bounds.
pub(crate) trait RegistryKey: Copy + Ord + Send + Sync + 'static {
    fn from_raw(raw: u64) -> Self;
}

impl RegistryKey for ClientKey {
    fn from_raw(raw: u64) -> Self {
        ClientKey(raw)
    }
}

impl RegistryKey for PortKey {
    fn from_raw(raw: u64) -> Self {
        PortKey(raw)
    }
}

impl RegistryKey for WorkerKey {
    fn from_raw(raw: u64) -> Self {
        WorkerKey(raw)
    }
}

impl RegistryKey for RingKey {
    fn from_raw(raw: u64) -> Self {
        RingKey(raw)
    }
}

/// Copy-on-write map from keys to shared values.
///
/// Mutation is serialized by the caller (all writers go through the session's
/// control surface); reads are lock-free from any thread.
pub(crate) struct Registry<K, T> {
    next: AtomicU64,
    map: SharedCell<BTreeMap<K, Shared<T>>>,
}

impl<K, T> Registry<K, T>
where
    K: RegistryKey,
    T: Send + Sync + 'static,
{
    pub(crate) fn new(handle: &Handle) -> Self {
        Self {
            next: AtomicU64::new(1),
            map: SharedCell::new(Shared::new(handle, BTreeMap::new())),
        }
    }

    /// Allocate the next key and publish a snapshot containing `value`.
    /// Returns the key together with a handle to the stored value.
    pub(crate) fn insert(&self, handle: &Handle, value: T) -> (K, Shared<T>) {
        let key = K::from_raw(self.next.fetch_add(1, Ordering::Relaxed));
        let shared = Shared::new(handle, value);
        let mut map = BTreeMap::clone(&self.map.get());
        map.insert(key, shared.clone());
        drop(self.map.replace(Shared::new(handle, map)));
        (key, shared)
    }

    /// Lock-free lookup. `None` means the key was never issued or its entry
    /// has been removed.
    pub(crate) fn find(&self, key: K) -> Option<Shared<T>> {
        self.map.get().get(&key).cloned()
    }

    pub(crate) fn contains(&self, key: K) -> bool {
        self.map.get().contains_key(&key)
    }

    /// Drop the entry from the published map. The value itself is freed
    /// through the collector once every outstanding [`Shared`] is gone.
    pub(crate) fn remove(&self, handle: &Handle, key: K) -> Option<Shared<T>> {
        let mut map = BTreeMap::clone(&self.map.get());
        let removed = map.remove(&key)?;
        drop(self.map.replace(Shared::new(handle, map)));
        Some(removed)
    }

    /// Current snapshot for iteration outside the mutation path
    pub(crate) fn snapshot(&self) -> Shared<BTreeMap<K, Shared<T>>> {
        self.map.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Collector;

    #[test]
    fn keys_increase_and_are_never_reused() {
        let mut collector = Collector::new();
        let handle = collector.handle();
        let reg: Registry<ClientKey, &'static str> = Registry::new(&handle);

        let (k1, _) = reg.insert(&handle, "a");
        let (k2, _) = reg.insert(&handle, "b");
        assert_eq!(k1.raw(), 1);
        assert_eq!(k2.raw(), 2);

        assert!(reg.remove(&handle, k1).is_some());
        let (k3, _) = reg.insert(&handle, "c");
        assert_eq!(k3.raw(), 3);

        assert!(reg.find(k1).is_none());
        assert!(!reg.contains(k1));
        assert_eq!(*reg.find(k3).unwrap(), "c");

        collector.collect();
    }

    #[test]
    fn snapshots_keep_live_keys_in_order() {
        let mut collector = Collector::new();
        let handle = collector.handle();
        let reg: Registry<PortKey, u32> = Registry::new(&handle);

        let (k1, _) = reg.insert(&handle, 10);
        let (k2, _) = reg.insert(&handle, 20);
        let (k3, _) = reg.insert(&handle, 30);
        reg.remove(&handle, k2);

        let before = reg.snapshot();
        let (k4, _) = reg.insert(&handle, 40);

        let keys: Vec<PortKey> = reg.snapshot().keys().copied().collect();
        assert_eq!(keys, vec![k1, k3, k4]);

        // the older snapshot is unaffected by the later insert
        assert_eq!(before.keys().copied().collect::<Vec<_>>(), vec![k1, k3]);

        collector.collect();
    }

    #[test]
    fn removed_values_stay_alive_for_existing_holders() {
        let mut collector = Collector::new();
        let handle = collector.handle();
        let reg: Registry<RingKey, String> = Registry::new(&handle);

        let (key, held) = reg.insert(&handle, String::from("held"));
        reg.remove(&handle, key);

        assert!(reg.find(key).is_none());
        assert_eq!(&*held, "held");

        drop(held);
        drop(reg);
        collector.collect();
    }

    #[test]
    fn snapshots_are_readable_from_other_threads() {
        let mut collector = Collector::new();
        let handle = collector.handle();
        let reg: Registry<WorkerKey, u32> = Registry::new(&handle);

        let (key, _) = reg.insert(&handle, 7);
        let snapshot = reg.snapshot();
        let seen = std::thread::spawn(move || snapshot.get(&key).map(|value| **value))
            .join()
            .unwrap();
        assert_eq!(seen, Some(7));

        collector.collect();
    }
}
