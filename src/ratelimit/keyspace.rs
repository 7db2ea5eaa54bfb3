//! Coordination key naming.

use crate::error::{Result, WindowguardError};

/// The logical role a coordination key plays for one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRole {
    /// Number of events seen in the current window
    Counter,
    /// Unix time the current window began
    WindowStart,
    /// Unix time the current window expires
    Deadline,
}

impl KeyRole {
    pub const ALL: [KeyRole; 3] = [KeyRole::Counter, KeyRole::WindowStart, KeyRole::Deadline];

    /// Suffix appended to the base key for this role.
    pub fn suffix(&self) -> &'static str {
        match self {
            KeyRole::Counter => "requests",
            KeyRole::WindowStart => "time_initialized",
            KeyRole::Deadline => "deadline",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.suffix() == suffix)
    }
}

/// The namespace of one limiter instance inside the shared store.
///
/// All key names are produced here. Format: `{base}_{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Keyspace {
    base: String,
}

impl Keyspace {
    /// Create a keyspace for a base key. The base key must be non-empty,
    /// otherwise a reset would wipe the whole store.
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let base = base.into();
        if base.trim().is_empty() {
            return Err(WindowguardError::Config(
                "base key must not be empty".to_string(),
            ));
        }
        Ok(Self { base })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// The store key for a role.
    pub fn key(&self, role: KeyRole) -> String {
        format!("{}_{}", self.base, role.suffix())
    }

    /// Prefix covering every key owned by this limiter.
    pub fn prefix(&self) -> &str {
        &self.base
    }

    /// Map a store key back to its role, if it belongs to this keyspace.
    pub fn role_of(&self, key: &str) -> Option<KeyRole> {
        let rest = key.strip_prefix(&self.base)?.strip_prefix('_')?;
        KeyRole::from_suffix(rest)
    }
}

impl std::fmt::Display for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base)
    }
}
