//! Window state held in the shared store.
//!
//! Three coordination keys describe the current window: the event counter,
//! the window start and the deadline. They are created lazily by whichever
//! process touches the limiter first and deleted together once the deadline
//! has passed.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::{Result, WindowguardError};
use crate::store::KeyValueStore;

use super::keyspace::{KeyRole, Keyspace};

/// Default number of compare-and-swap attempts before giving up on a counter.
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 32;

/// Outcome of checking the window deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    /// The window is still running
    Active { deadline: i64 },
    /// The deadline had passed and the keyspace was wiped
    Expired { deadline: i64, deleted: u64 },
}

impl WindowStatus {
    pub fn deadline(&self) -> i64 {
        match self {
            WindowStatus::Active { deadline } | WindowStatus::Expired { deadline, .. } => *deadline,
        }
    }

    pub fn was_reset(&self) -> bool {
        matches!(self, WindowStatus::Expired { .. })
    }
}

/// Point-in-time view of the three coordination keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WindowSnapshot {
    pub count: Option<u64>,
    pub window_start: Option<i64>,
    pub deadline: Option<i64>,
}

impl WindowSnapshot {
    /// True when no coordination key exists.
    pub fn is_empty(&self) -> bool {
        self.count.is_none() && self.window_start.is_none() && self.deadline.is_none()
    }

    /// Seconds left until the deadline, zero once it has passed.
    pub fn seconds_until_reset(&self, now: i64) -> Option<u64> {
        self.deadline.map(|d| d.saturating_sub(now).max(0) as u64)
    }
}

/// Read a key and parse its decimal text, returning the value and its revision.
pub(crate) async fn read_parsed<T: FromStr>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<(T, u64)> {
    let stored = store
        .get(key)
        .await?
        .ok_or_else(|| WindowguardError::MissingKey {
            key: key.to_string(),
        })?;

    let parsed = stored
        .value
        .trim()
        .parse::<T>()
        .map_err(|_| WindowguardError::Malformed {
            key: key.to_string(),
            value: stored.value.clone(),
        })?;

    trace!(key = %key, revision = stored.mod_revision, "Read coordination key");
    Ok((parsed, stored.mod_revision))
}

async fn read_optional<T: FromStr>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match read_parsed::<T>(store, key).await {
        Ok((value, _)) => Ok(Some(value)),
        Err(WindowguardError::MissingKey { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Window length in whole seconds, rounding a fractional second up.
fn window_length_secs(interval: Duration) -> Result<i64> {
    let secs = interval
        .as_secs()
        .checked_add(u64::from(interval.subsec_nanos() > 0));
    secs.and_then(|s| i64::try_from(s).ok()).ok_or_else(|| {
        WindowguardError::Config(format!(
            "Interval of {}s is too long to express as a deadline",
            interval.as_secs()
        ))
    })
}

fn backoff_delay(attempt: u32) -> Duration {
    let ceiling = 100 * u64::from(attempt.min(10));
    Duration::from_micros(rand::thread_rng().gen_range(0..=ceiling))
}

/// Manages the coordination keys of one limiter instance.
pub struct WindowStateManager {
    store: Arc<dyn KeyValueStore>,
    keys: Keyspace,
    interval: Duration,
    clock: Arc<dyn Clock>,
    max_cas_retries: u32,
}

impl WindowStateManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: Keyspace,
        interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            keys,
            interval,
            clock,
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the compare-and-swap attempt budget (at least one attempt is made).
    pub fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.max_cas_retries = retries.max(1);
        self
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Write `default_value` under `key` unless the key already exists.
    ///
    /// The write is a create-only compare-and-swap, so racing initializers
    /// cannot clobber a value another process has already moved on from.
    /// Returns whether this call created the key.
    pub async fn ensure_initialized(&self, key: &str, default_value: &str) -> Result<bool> {
        if self.store.get(key).await?.is_some() {
            return Ok(false);
        }

        let created = self.store.compare_and_swap(key, None, default_value).await?;
        if created {
            debug!(key = %key, value = %default_value, "Initialized coordination key");
        } else {
            trace!(key = %key, "Coordination key created concurrently");
        }
        Ok(created)
    }

    /// Make sure all three coordination keys exist, opening a window at
    /// the current time if they do not.
    ///
    /// The deadline is derived from the stored window start, so a process
    /// that loses the race to open the window still writes a deadline one
    /// interval after the winner's start.
    pub async fn ensure_window(&self) -> Result<()> {
        let length = window_length_secs(self.interval)?;
        let now = self.clock.now();

        self.ensure_initialized(&self.keys.key(KeyRole::Counter), "0")
            .await?;

        let start_key = self.keys.key(KeyRole::WindowStart);
        let start = if self.ensure_initialized(&start_key, &now.to_string()).await? {
            now
        } else {
            read_optional::<i64>(self.store.as_ref(), &start_key)
                .await?
                .unwrap_or(now)
        };

        let deadline = start.checked_add(length).ok_or_else(|| {
            WindowguardError::Config(format!(
                "Window starting at {} with length {}s ends past the representable time range",
                start, length
            ))
        })?;
        self.ensure_initialized(&self.keys.key(KeyRole::Deadline), &deadline.to_string())
            .await?;
        Ok(())
    }

    /// Compare the stored deadline with the clock and reset the keyspace once
    /// the window is over.
    ///
    /// The window covers `[start, deadline)`, so it is expired at
    /// `now >= deadline`. A missing or non-numeric deadline is a read error.
    pub async fn evaluate_deadline(&self) -> Result<WindowStatus> {
        let key = self.keys.key(KeyRole::Deadline);
        let (deadline, _) = read_parsed::<i64>(self.store.as_ref(), &key).await?;
        let now = self.clock.now();

        if now < deadline {
            trace!(keyspace = %self.keys, deadline, now, "Window still active");
            return Ok(WindowStatus::Active { deadline });
        }

        let deleted = self.reset_namespace().await?;
        debug!(
            keyspace = %self.keys,
            deadline,
            now,
            deleted,
            "Window expired, keyspace reset"
        );
        Ok(WindowStatus::Expired { deadline, deleted })
    }

    /// Delete every key under the base-key prefix.
    pub async fn reset_namespace(&self) -> Result<u64> {
        let deleted = self.store.delete_prefix(self.keys.prefix()).await?;
        trace!(prefix = %self.keys.prefix(), deleted, "Deleted keyspace");
        Ok(deleted)
    }

    /// Count one event, creating the window first if needed.
    ///
    /// The increment is an optimistic read / compare-and-swap loop on the
    /// counter's revision, so concurrent callers never lose updates.
    /// Returns the counter value written by this call.
    pub async fn increment_counter(&self) -> Result<u64> {
        self.ensure_window().await?;

        let key = self.keys.key(KeyRole::Counter);
        for attempt in 1..=self.max_cas_retries {
            let (count, revision) = read_parsed::<u64>(self.store.as_ref(), &key).await?;
            let next = count.saturating_add(1);

            if self
                .store
                .compare_and_swap(&key, Some(revision), &next.to_string())
                .await?
            {
                trace!(key = %key, count = next, attempt, "Incremented counter");
                return Ok(next);
            }

            debug!(key = %key, attempt, "Counter changed underneath us, retrying");
            let delay = backoff_delay(attempt);
            tokio::time::sleep(delay).await;
        }

        Err(WindowguardError::Contention {
            key,
            attempts: self.max_cas_retries,
        })
    }

    /// Read all three coordination keys. Absent keys are `None`.
    pub async fn window_snapshot(&self) -> Result<WindowSnapshot> {
        let store = self.store.as_ref();
        Ok(WindowSnapshot {
            count: read_optional(store, &self.keys.key(KeyRole::Counter)).await?,
            window_start: read_optional(store, &self.keys.key(KeyRole::WindowStart)).await?,
            deadline: read_optional(store, &self.keys.key(KeyRole::Deadline)).await?,
        })
    }
}

impl std::fmt::Debug for WindowStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowStateManager")
            .field("keys", &self.keys)
            .field("interval", &self.interval)
            .field("max_cas_retries", &self.max_cas_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    const START: i64 = 1_700_000_000;

    fn manager(store: Arc<MemoryStore>, clock: ManualClock) -> WindowStateManager {
        manager_with_interval(store, clock, Duration::from_secs(60))
    }

    fn manager_with_interval(
        store: Arc<MemoryStore>,
        clock: ManualClock,
        interval: Duration,
    ) -> WindowStateManager {
        WindowStateManager::new(
            store,
            Keyspace::new("api").unwrap(),
            interval,
            Arc::new(clock),
        )
    }

    #[tokio::test]
    async fn test_interval_beyond_i64_is_config_error() {
        let store = Arc::new(MemoryStore::new());
        let window = manager_with_interval(
            store.clone(),
            ManualClock::new(START),
            Duration::from_secs(u64::MAX),
        );

        let err = window.increment_counter().await.unwrap_err();
        assert!(matches!(err, WindowguardError::Config(_)));
        assert_eq!(store.stats().total(), 0);
    }

    #[tokio::test]
    async fn test_deadline_overflow_is_config_error() {
        let store = Arc::new(MemoryStore::new());
        let window = manager_with_interval(
            store.clone(),
            ManualClock::new(START),
            Duration::from_secs(i64::MAX as u64),
        );

        let err = window.ensure_window().await.unwrap_err();
        assert!(matches!(err, WindowguardError::Config(_)));
        assert!(store.get("api_deadline").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fractional_interval_rounds_up() {
        let store = Arc::new(MemoryStore::new());
        let window = manager_with_interval(
            store,
            ManualClock::new(START),
            Duration::from_millis(90_900),
        );

        window.ensure_window().await.unwrap();
        assert_eq!(window.window_snapshot().await.unwrap().deadline, Some(START + 91));
    }

    #[tokio::test]
    async fn test_deadline_follows_stored_window_start() {
        let store = Arc::new(MemoryStore::new());
        // Another process opened the window with a clock ten seconds behind
        store.put("api_time_initialized", &(START - 10).to_string()).await.unwrap();
        let window = manager(store, ManualClock::new(START));

        window.ensure_window().await.unwrap();

        let snapshot = window.window_snapshot().await.unwrap();
        assert_eq!(snapshot.window_start, Some(START - 10));
        assert_eq!(snapshot.deadline, Some(START + 50));
    }

    #[tokio::test]
    async fn test_ensure_initialized_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let window = manager(store.clone(), ManualClock::new(START));

        assert!(window.ensure_initialized("api_requests", "0").await.unwrap());
        let before = store.get("api_requests").await.unwrap().unwrap();

        assert!(!window.ensure_initialized("api_requests", "0").await.unwrap());
        let after = store.get("api_requests").await.unwrap().unwrap();

        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_ensure_initialized_keeps_existing_value() {
        let store = Arc::new(MemoryStore::new());
        store.put("api_requests", "4").await.unwrap();
        let window = manager(store.clone(), ManualClock::new(START));

        window.ensure_initialized("api_requests", "0").await.unwrap();
        assert_eq!(store.get("api_requests").await.unwrap().unwrap().value, "4");
    }

    #[tokio::test]
    async fn test_increment_initializes_window() {
        let store = Arc::new(MemoryStore::new());
        let window = manager(store.clone(), ManualClock::new(START));

        assert_eq!(window.increment_counter().await.unwrap(), 1);

        let snapshot = window.window_snapshot().await.unwrap();
        assert_eq!(snapshot.count, Some(1));
        assert_eq!(snapshot.window_start, Some(START));
        assert_eq!(snapshot.deadline, Some(START + 60));
    }

    #[tokio::test]
    async fn test_increment_does_not_move_window() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(START);
        let window = manager(store.clone(), clock.clone());

        window.increment_counter().await.unwrap();
        clock.advance(Duration::from_secs(30));
        assert_eq!(window.increment_counter().await.unwrap(), 2);

        let snapshot = window.window_snapshot().await.unwrap();
        assert_eq!(snapshot.window_start, Some(START));
        assert_eq!(snapshot.deadline, Some(START + 60));
    }

    #[tokio::test]
    async fn test_evaluate_deadline_missing_key_is_read_error() {
        let store = Arc::new(MemoryStore::new());
        let window = manager(store, ManualClock::new(START));

        let err = window.evaluate_deadline().await.unwrap_err();
        assert!(matches!(err, WindowguardError::MissingKey { ref key } if key == "api_deadline"));
    }

    #[tokio::test]
    async fn test_evaluate_deadline_malformed_is_read_error() {
        let store = Arc::new(MemoryStore::new());
        store.put("api_deadline", "soon").await.unwrap();
        let window = manager(store, ManualClock::new(START));

        let err = window.evaluate_deadline().await.unwrap_err();
        assert!(err.is_read_error());
        assert!(matches!(err, WindowguardError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_active_window_is_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(START);
        let window = manager(store.clone(), clock.clone());

        window.increment_counter().await.unwrap();
        clock.advance(Duration::from_secs(59));

        let status = window.evaluate_deadline().await.unwrap();
        assert_eq!(status, WindowStatus::Active { deadline: START + 60 });
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_expired_window_resets_keyspace() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(START);
        let window = manager(store.clone(), clock.clone());

        window.increment_counter().await.unwrap();
        store.put("api", "1").await.unwrap();
        clock.advance(Duration::from_secs(60));

        let status = window.evaluate_deadline().await.unwrap();
        assert!(status.was_reset());
        assert_eq!(status.deadline(), START + 60);
        assert!(store.is_empty());
        assert!(window.window_snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_increment_after_reset_starts_from_one() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(START);
        let window = manager(store.clone(), clock.clone());

        for _ in 0..3 {
            window.increment_counter().await.unwrap();
        }
        clock.advance(Duration::from_secs(120));
        window.evaluate_deadline().await.unwrap();

        assert_eq!(window.increment_counter().await.unwrap(), 1);
        let snapshot = window.window_snapshot().await.unwrap();
        assert_eq!(snapshot.window_start, Some(START + 120));
        assert_eq!(snapshot.deadline, Some(START + 180));
    }

    #[tokio::test]
    async fn test_increment_rejects_malformed_counter() {
        let store = Arc::new(MemoryStore::new());
        store.put("api_requests", "many").await.unwrap();
        let window = manager(store, ManualClock::new(START));

        let err = window.increment_counter().await.unwrap_err();
        assert!(matches!(err, WindowguardError::Malformed { ref value, .. } if value == "many"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let window = Arc::new(manager(store.clone(), ManualClock::new(START)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let window = window.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        window.increment_counter().await.unwrap();
                    }
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        assert_eq!(window.window_snapshot().await.unwrap().count, Some(200));
    }

    #[test]
    fn test_snapshot_seconds_until_reset() {
        let snapshot = WindowSnapshot {
            count: Some(2),
            window_start: Some(100),
            deadline: Some(160),
        };
        assert_eq!(snapshot.seconds_until_reset(130), Some(30));
        assert_eq!(snapshot.seconds_until_reset(200), Some(0));
        assert_eq!(WindowSnapshot::default().seconds_until_reset(0), None);
    }
}
