//! Fixed-window rate limiting over a shared key-value store.

mod evaluator;
mod flush;
mod keyspace;
mod limiter;
mod window;

pub use evaluator::{exceeds, LimitEvaluator};
pub use flush::{FlushHandle, FlushState, FlushTask};
pub use keyspace::{KeyRole, Keyspace};
pub use limiter::{Decision, FailurePolicy, LimitConfig, WindowLimiter, MIN_INTERVAL};
pub use window::{WindowSnapshot, WindowStateManager, WindowStatus, DEFAULT_MAX_CAS_RETRIES};
