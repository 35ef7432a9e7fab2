//! Key-value persistence port and the in-memory adapter.
//!
//! Values are JSON strings under string keys. Every key carries a version that
//! grows on each write, deletes included: a delete leaves a tombstone one
//! version above the last value, so a re-created key never reuses a version.
//! Version `0` means the key was never written. Writes are compare-and-swap on
//! that version so two writers sharing a store cannot silently overwrite each
//! other.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a [`KvStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The key changed since the caller read it.
    #[error("version conflict on '{key}': expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },
    /// A transient failure; the call may succeed if repeated.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A permanent backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored value and its version. `value` is `None` for a deleted or
/// never-written key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Versioned {
    pub value: Option<String>,
    pub version: u64,
}

/// String-keyed storage with per-key compare-and-swap writes.
///
/// There is no multi-key transaction; callers needing one go through the
/// commit journal.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Reads a key. An absent key reads as no value at its tombstone version.
    async fn get(&self, key: &str) -> StoreResult<Versioned>;

    /// Writes `value` if the key is still at `expected` and returns the new version.
    async fn put(&self, key: &str, value: &str, expected: u64) -> StoreResult<u64>;

    /// Replaces the value with a tombstone if the key is still at `expected`
    /// and returns the tombstone's version.
    async fn delete(&self, key: &str, expected: u64) -> StoreResult<u64>;
}

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<String, Versioned>,
    /// Successful writes to let through before failing.
    fail_after: usize,
    /// Write attempts to fail once `fail_after` is used up.
    fail_count: usize,
}

impl MemoryInner {
    fn check_fault(&mut self, key: &str) -> StoreResult<()> {
        if self.fail_count == 0 {
            return Ok(());
        }
        if self.fail_after > 0 {
            self.fail_after -= 1;
            return Ok(());
        }
        self.fail_count -= 1;
        Err(StoreError::Unavailable(format!("injected write failure on '{key}'")))
    }

    fn swap(&mut self, key: &str, value: Option<&str>, expected: u64) -> StoreResult<u64> {
        self.check_fault(key)?;
        let actual = self.entries.get(key).map(|e| e.version).unwrap_or(0);
        if actual != expected {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        let version = actual + 1;
        self.entries.insert(
            key.to_string(),
            Versioned {
                value: value.map(str::to_string),
                version,
            },
        );
        Ok(version)
    }
}

/// Process-local store, the stand-in for browser storage.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `entries`, each at version 1.
    pub fn seeded<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for (key, value) in entries {
                inner.entries.insert(
                    key.into(),
                    Versioned {
                        value: Some(value.into()),
                        version: 1,
                    },
                );
            }
        }
        store
    }

    /// Lets `after` writes through, then fails the next `count` write attempts
    /// with [`StoreError::Unavailable`].
    pub fn inject_write_failures(&self, after: usize, count: usize) {
        let mut inner = self.lock();
        inner.fail_after = after;
        inner.fail_count = count;
    }

    /// Raw value of a key, bypassing versioning.
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().entries.get(key).and_then(|e| e.value.clone())
    }

    /// All live keys and values; tombstones are left out.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.lock()
            .entries
            .iter()
            .filter_map(|(k, v)| v.value.clone().map(|value| (k.clone(), value)))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Versioned> {
        Ok(self.lock().entries.get(key).cloned().unwrap_or_default())
    }

    async fn put(&self, key: &str, value: &str, expected: u64) -> StoreResult<u64> {
        self.lock().swap(key, Some(value), expected)
    }

    async fn delete(&self, key: &str, expected: u64) -> StoreResult<u64> {
        self.lock().swap(key, None, expected)
    }
}
