//! Abstract storage interface for quota records.
//!
//! The driver coordinates racing processes purely through this interface, so
//! the contract is the whole correctness story: a [`commit`](StoreTxn::commit)
//! must land only if the watched key is unchanged since
//! [`watch`](BucketStore::watch) observed it. A key that expired or appeared
//! in between counts as changed. No other coordination primitive is assumed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// The watched key was unchanged and the write landed.
    Committed,
    /// A concurrent writer got there first; nothing was written.
    Conflict,
}

/// A key-value store supporting optimistic transactions on single keys.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;
    /// Transaction handle produced by [`watch`](Self::watch).
    type Txn: StoreTxn<Error = Self::Error>;

    /// Begin watching `key` and observe its current value.
    async fn watch(&self, key: &str) -> Result<Self::Txn, Self::Error>;
}

/// One optimistic transaction: the observed read plus the conditional write.
#[async_trait]
pub trait StoreTxn: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The watched key's value when the watch began; `None` if absent.
    fn current(&self) -> Option<&str>;

    /// Write `value` with `ttl`, only if the watched key is still unchanged.
    async fn commit(self, value: &str, ttl: Duration) -> Result<Commit, Self::Error>;

    /// Drop the watch without writing.
    async fn discard(self) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Default)]
struct Shared {
    entries: Mutex<HashMap<String, Entry>>,
    versions: AtomicU64,
}

/// In-memory store for tests and single-process deployments.
///
/// Conflict detection is version-based: every committed write gets a fresh
/// version from a store-wide counter, so a key that is deleted by expiry and
/// recreated can never alias the version a stale watcher observed.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the raw stored value for a key, honoring expiry. Useful for
    /// inspecting what the protocol actually persisted.
    pub fn peek(&self, key: &str) -> Option<String> {
        let entries = self.shared.entries.lock().unwrap();
        entries.get(key).filter(|e| !e.expired()).map(|e| e.value.clone())
    }
}

/// Transaction handle for [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemoryTxn {
    shared: Arc<Shared>,
    key: String,
    observed: Option<(String, u64)>,
}

#[async_trait]
impl BucketStore for InMemoryStore {
    type Error = std::convert::Infallible;
    type Txn = InMemoryTxn;

    async fn watch(&self, key: &str) -> Result<InMemoryTxn, Self::Error> {
        let mut entries = self.shared.entries.lock().unwrap();
        // Expired entries are indistinguishable from absent ones.
        if entries.get(key).is_some_and(Entry::expired) {
            entries.remove(key);
        }
        let observed = entries.get(key).map(|e| (e.value.clone(), e.version));
        Ok(InMemoryTxn { shared: Arc::clone(&self.shared), key: key.to_string(), observed })
    }
}

#[async_trait]
impl StoreTxn for InMemoryTxn {
    type Error = std::convert::Infallible;

    fn current(&self) -> Option<&str> {
        self.observed.as_ref().map(|(value, _)| value.as_str())
    }

    async fn commit(self, value: &str, ttl: Duration) -> Result<Commit, Self::Error> {
        let mut entries = self.shared.entries.lock().unwrap();
        let live = entries.get(&self.key).filter(|e| !e.expired()).map(|e| e.version);
        let unchanged = match (live, &self.observed) {
            (None, None) => true,
            (Some(live), Some((_, observed))) => live == *observed,
            _ => false,
        };
        if !unchanged {
            return Ok(Commit::Conflict);
        }
        let version = self.shared.versions.fetch_add(1, Ordering::Relaxed) + 1;
        entries.insert(
            self.key,
            Entry {
                value: value.to_string(),
                version,
                expires_at: Instant::now().checked_add(ttl),
            },
        );
        Ok(Commit::Committed)
    }

    async fn discard(self) -> Result<(), Self::Error> {
        Ok(())
    }
}
