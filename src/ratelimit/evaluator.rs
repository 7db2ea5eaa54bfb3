//! Limit checks against the shared counter.

use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::store::KeyValueStore;

use super::keyspace::{KeyRole, Keyspace};
use super::window::read_parsed;

/// Whether `count` events exceed a limit of `limit`.
///
/// Reaching the limit exactly is still allowed.
pub fn exceeds(count: u64, limit: u64) -> bool {
    count > limit
}

/// Answers "is this limiter over its limit right now?".
///
/// Read-only: never resets or increments the window.
pub struct LimitEvaluator {
    store: Arc<dyn KeyValueStore>,
    counter_key: String,
    limit: u64,
}

impl LimitEvaluator {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: &Keyspace, limit: u64) -> Self {
        Self {
            store,
            counter_key: keys.key(KeyRole::Counter),
            limit,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Read the current counter. Missing or non-numeric values are errors.
    pub async fn current_count(&self) -> Result<u64> {
        let (count, _) = read_parsed::<u64>(self.store.as_ref(), &self.counter_key).await?;
        Ok(count)
    }

    /// True iff the stored counter is strictly greater than the limit.
    pub async fn is_over_limit(&self) -> Result<bool> {
        let count = self.current_count().await?;
        let over = exceeds(count, self.limit);
        trace!(key = %self.counter_key, count, limit = self.limit, over, "Evaluated limit");
        Ok(over)
    }

    /// Events still permitted in the current window.
    pub async fn remaining(&self) -> Result<u64> {
        let count = self.current_count().await?;
        Ok(self.limit.saturating_sub(count))
    }
}
