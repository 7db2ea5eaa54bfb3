//! In-process store with etcd-like revision semantics.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{KeyValueStore, StoreError, VersionedValue};

/// Number of calls made against a [`MemoryStore`], per request shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub gets: u64,
    pub puts: u64,
    pub deletes: u64,
    pub compare_and_swaps: u64,
}

impl StoreStats {
    pub fn total(&self) -> u64 {
        self.gets + self.puts + self.deletes + self.compare_and_swaps
    }
}

#[derive(Default)]
struct CallCounters {
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    compare_and_swaps: AtomicU64,
}

/// A linearizable key-value store living in memory.
///
/// Every write bumps a store-wide revision, and each key remembers the
/// revision of its last modification, which is what compare-and-swap guards
/// on. Per-key operations are serialized by the map's shard locks.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, VersionedValue>,
    revision: AtomicU64,
    calls: CallCounters,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of how many requests each operation has served.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            gets: self.calls.gets.load(Ordering::Relaxed),
            puts: self.calls.puts.load(Ordering::Relaxed),
            deletes: self.calls.deletes.load(Ordering::Relaxed),
            compare_and_swaps: self.calls.compare_and_swaps.load(Ordering::Relaxed),
        }
    }

    /// Current store-wide revision.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.entries.len())
            .field("revision", &self.revision())
            .finish()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        self.calls.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.calls.puts.fetch_add(1, Ordering::Relaxed);
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| VersionedValue {
            value: String::new(),
            mod_revision: 0,
        });
        let revision = self.next_revision();
        slot.value = value.to_string();
        slot.mod_revision = revision;
        trace!(key = %key, revision, "put");
        Ok(revision)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        self.calls.deletes.fetch_add(1, Ordering::Relaxed);
        let mut deleted = 0u64;
        self.entries.retain(|k, _| {
            if k.starts_with(prefix) {
                deleted += 1;
                false
            } else {
                true
            }
        });
        if deleted > 0 {
            self.next_revision();
        }
        trace!(prefix = %prefix, deleted, "delete_prefix");
        Ok(deleted)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &str,
    ) -> Result<bool, StoreError> {
        self.calls.compare_and_swaps.fetch_add(1, Ordering::Relaxed);
        // The entry guard holds the shard lock, so check and write are one step.
        let swapped = match (self.entries.entry(key.to_string()), expected) {
            (Entry::Vacant(vacant), None) => {
                let mod_revision = self.next_revision();
                vacant.insert(VersionedValue {
                    value: value.to_string(),
                    mod_revision,
                });
                true
            }
            (Entry::Occupied(mut occupied), Some(rev)) if occupied.get().mod_revision == rev => {
                let mod_revision = self.next_revision();
                occupied.insert(VersionedValue {
                    value: value.to_string(),
                    mod_revision,
                });
                true
            }
            _ => false,
        };
        trace!(key = %key, ?expected, swapped, "compare_and_swap");
        Ok(swapped)
    }
}
