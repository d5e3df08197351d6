//! Advisory, TTL-expiring locks over externally named resources.
//!
//! These are hints for cooperating handlers, not a mutex. Acquisition always
//! succeeds and overwrites; staleness is evaluated when queried.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

/// Default lock lifetime.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Table of advisory resource locks.
#[derive(Debug)]
pub struct ResourceLockTable {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl Default for ResourceLockTable {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL)
    }
}

impl ResourceLockTable {
    /// Create a table whose entries expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Lock lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Take the lock on `key`, replacing any previous holder.
    pub fn acquire(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        tracing::trace!(resource = %key, "Acquiring resource lock");
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Instant::now());
        true
    }

    /// Take the lock on `key` only if no live lock holds it.
    pub fn acquire_if_free(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries
            .get(&key)
            .is_some_and(|acquired_at| acquired_at.elapsed() <= self.ttl)
        {
            return false;
        }
        entries.insert(key, Instant::now());
        true
    }

    /// Drop the lock on `key`. Returns whether an entry existed.
    pub fn release(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Whether `key` is held by a live lock.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|acquired_at| acquired_at.elapsed() <= self.ttl)
    }

    /// Keys currently held by live locks.
    #[must_use]
    pub fn held(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, at)| at.elapsed() <= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}
