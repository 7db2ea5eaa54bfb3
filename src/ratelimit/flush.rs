//! Periodic window maintenance.
//!
//! Windows are normally reset by the next event after the deadline. The flush
//! task does the same on a timer, so an idle limiter does not keep a stale
//! window around, and it keeps a cached snapshot of the shared state for
//! diagnostics. The cached snapshot is advisory; decisions always go to the
//! store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, WindowguardError};

use super::limiter::WindowLimiter;
use super::window::WindowSnapshot;

/// The last state the flush task read from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FlushState {
    pub snapshot: WindowSnapshot,
    /// Unix time of the read
    pub synced_at: i64,
}

/// Handle to a running flush task.
///
/// Dropping the handle aborts the task; [`FlushHandle::shutdown`] stops it
/// gracefully.
pub struct FlushHandle {
    state: Arc<RwLock<Option<FlushState>>>,
    ticks: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FlushHandle {
    /// Most recent snapshot, if any tick has completed a read.
    pub fn snapshot(&self) -> Option<FlushState> {
        *self.state.read()
    }

    /// Number of ticks processed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the task and wait for it to finish its current tick.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Flush task ended abnormally");
            }
        }
    }
}

impl Drop for FlushHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawner for the background flush loop.
pub struct FlushTask;

impl FlushTask {
    /// Start flushing `limiter` every `limiter.flush_interval()`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(limiter: Arc<WindowLimiter>) -> Result<FlushHandle> {
        let period = limiter.flush_interval();
        if period.is_zero() {
            return Err(WindowguardError::Config(
                "flush interval must be greater than zero".to_string(),
            ));
        }

        let state = Arc::new(RwLock::new(None));
        let ticks = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task_state = state.clone();
        let task_ticks = ticks.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut timer = IntervalStream::new(interval);

            info!(
                keyspace = %limiter.keyspace(),
                period_ms = period.as_millis() as u64,
                "Flush task started"
            );

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    tick = timer.next() => {
                        if tick.is_none() {
                            break;
                        }
                        flush_once(&limiter, &task_state).await;
                        task_ticks.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }

            info!(keyspace = %limiter.keyspace(), "Flush task stopped");
        });

        Ok(FlushHandle {
            state,
            ticks,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

async fn flush_once(limiter: &WindowLimiter, state: &RwLock<Option<FlushState>>) {
    match limiter.evaluate_deadline().await {
        Ok(status) if status.was_reset() => {
            debug!(keyspace = %limiter.keyspace(), deadline = status.deadline(), "Flush reset an expired window");
        }
        Ok(_) => {}
        // No window has been opened yet
        Err(WindowguardError::MissingKey { .. }) => {}
        Err(e) => {
            warn!(keyspace = %limiter.keyspace(), error = %e, "Flush failed to evaluate deadline");
            return;
        }
    }

    match limiter.snapshot().await {
        Ok(snapshot) => {
            let synced_at = limiter.window().clock().now();
            trace!(keyspace = %limiter.keyspace(), ?snapshot, "Flushed window snapshot");
            *state.write() = Some(FlushState {
                snapshot,
                synced_at,
            });
        }
        Err(e) => {
            warn!(keyspace = %limiter.keyspace(), error = %e, "Flush failed to read window");
        }
    }
}
