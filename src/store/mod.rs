//! Key-value store abstraction.
//!
//! The limiter only ever issues four request shapes against the store:
//! get, put, delete-by-prefix and a revision-guarded compare-and-swap.
//! Anything that offers those with linearizable semantics (etcd, a Raft-backed
//! KV, or [`MemoryStore`] inside a single process) can carry the shared state.

mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{MemoryStore, StoreStats};

/// Errors surfaced by a store client.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store request timed out")]
    Timeout,
    #[error("store backend error: {0}")]
    Backend(String),
}

/// A stored value together with the revision that last modified it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: String,
    pub mod_revision: u64,
}

/// Trait for key-value store clients.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a key. Absent keys are `Ok(None)`, not an error.
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError>;

    /// Unconditionally write a key, returning the new revision.
    async fn put(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Delete every key starting with `prefix`, returning how many went away.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    /// Write `value` only if the key's current revision matches `expected`.
    ///
    /// `expected = None` means the key must not exist. Returns `Ok(false)`
    /// when the guard does not hold.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &str,
    ) -> Result<bool, StoreError>;
}
