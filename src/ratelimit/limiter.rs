//! The per-event entry point.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, WindowguardError};
use crate::store::KeyValueStore;

use super::evaluator::LimitEvaluator;
use super::keyspace::Keyspace;
use super::window::{WindowSnapshot, WindowStateManager, WindowStatus};

/// Shortest window the limiter accepts.
pub const MIN_INTERVAL: Duration = Duration::from_secs(60);

/// What to answer when a limit decision cannot be made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Let the event through
    Open,
    /// Reject the event
    #[default]
    Closed,
}

/// Result of a limit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

impl From<FailurePolicy> for Decision {
    fn from(policy: FailurePolicy) -> Self {
        match policy {
            FailurePolicy::Open => Decision::Allowed,
            FailurePolicy::Closed => Decision::Denied,
        }
    }
}

/// Configuration for a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    /// Maximum events allowed in one window
    pub limit: u64,
    /// Window length, rounded up to whole seconds
    pub interval: Duration,
    /// Cadence of the background flush task
    pub flush_interval: Duration,
}

impl LimitConfig {
    /// Check the interval against [`MIN_INTERVAL`].
    pub fn validate_interval(&self) -> Result<()> {
        if self.interval < MIN_INTERVAL {
            return Err(WindowguardError::Config(format!(
                "Minimum interval is 1 minute, got {}s",
                self.interval.as_secs_f64()
            )));
        }
        Ok(())
    }
}

/// A fixed-window rate limiter whose state lives entirely in a shared store.
///
/// Any number of instances, in any number of processes, built with the same
/// base key against the same store enforce one common limit.
pub struct WindowLimiter {
    id: Uuid,
    config: LimitConfig,
    window: WindowStateManager,
    evaluator: LimitEvaluator,
    failure_policy: FailurePolicy,
}

impl WindowLimiter {
    /// Create a limiter. No store access happens until the first event.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        base_key: impl Into<String>,
        limit: u64,
        interval: Duration,
        flush_interval: Duration,
    ) -> Result<Self> {
        let keys = Keyspace::new(base_key)?;
        let evaluator = LimitEvaluator::new(store.clone(), &keys, limit);
        let window = WindowStateManager::new(store, keys, interval, Arc::new(SystemClock));

        Ok(Self {
            id: Uuid::new_v4(),
            config: LimitConfig {
                limit,
                interval,
                flush_interval,
            },
            window,
            evaluator,
            failure_policy: FailurePolicy::default(),
        })
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.window = self.window.with_clock(clock);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.window = self.window.with_max_cas_retries(retries);
        self
    }

    /// Unique id of this instance, used in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    pub fn limit(&self) -> u64 {
        self.config.limit
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn flush_interval(&self) -> Duration {
        self.config.flush_interval
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn keyspace(&self) -> &Keyspace {
        self.window.keyspace()
    }

    pub fn window(&self) -> &WindowStateManager {
        &self.window
    }

    /// Record one event.
    ///
    /// Validates the interval before touching the store, opens a window if
    /// none exists, resets the keyspace when the current window is over and
    /// then increments the counter. Returns the counter after this event.
    /// Whether the event is over the limit is a separate question, see
    /// [`WindowLimiter::is_over_limit`] and [`WindowLimiter::check`].
    #[instrument(skip(self), fields(keyspace = %self.window.keyspace(), instance = %self.id))]
    pub async fn process_event(&self) -> Result<u64> {
        self.config.validate_interval()?;

        self.window.ensure_window().await?;
        if let WindowStatus::Expired { deadline, deleted } = self.window.evaluate_deadline().await? {
            debug!(deadline, deleted, "Starting a new window");
        }

        self.window.increment_counter().await
    }

    /// Whether the shared counter is above the limit.
    pub async fn is_over_limit(&self) -> Result<bool> {
        self.evaluator.is_over_limit().await
    }

    /// Events left in the current window.
    pub async fn remaining(&self) -> Result<u64> {
        self.evaluator.remaining().await
    }

    /// Record an event and decide whether it may proceed.
    ///
    /// Errors are returned as-is; the decision is unknown in that case.
    pub async fn check(&self) -> Result<Decision> {
        self.process_event().await?;
        if self.is_over_limit().await? {
            debug!(keyspace = %self.window.keyspace(), limit = self.config.limit, "Rate limit exceeded");
            Ok(Decision::Denied)
        } else {
            Ok(Decision::Allowed)
        }
    }

    /// Like [`WindowLimiter::check`], but falls back to the failure policy
    /// when the decision cannot be made.
    pub async fn decide(&self) -> Decision {
        match self.check().await {
            Ok(decision) => decision,
            Err(e) => {
                let fallback = Decision::from(self.failure_policy);
                warn!(
                    keyspace = %self.window.keyspace(),
                    error = %e,
                    policy = ?self.failure_policy,
                    decision = ?fallback,
                    "Rate limit decision failed, applying failure policy"
                );
                fallback
            }
        }
    }

    /// Check the window deadline without counting an event.
    pub async fn evaluate_deadline(&self) -> Result<WindowStatus> {
        self.window.evaluate_deadline().await
    }

    /// Drop all coordination keys of this limiter.
    pub async fn reset(&self) -> Result<u64> {
        self.window.reset_namespace().await
    }

    pub async fn snapshot(&self) -> Result<WindowSnapshot> {
        self.window.window_snapshot().await
    }
}

impl std::fmt::Debug for WindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowLimiter")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("window", &self.window)
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}
