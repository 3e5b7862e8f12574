//! Bucket configuration with documented defaults.
//!
//! Defaults are applied at construction time, never through process-wide
//! mutable state: a zero or empty field means "use the default".

use std::time::Duration;

/// Default maximum token count.
pub const DEFAULT_CAPACITY: u32 = 10;
/// Default time to accrue one token.
pub const DEFAULT_REFILL_INTERVAL: Duration = Duration::from_secs(10);
/// Default idle time after which a stored record expires.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(30 * 60);
/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "floodgate";

/// Configuration consumed by [`TokenBucket`](crate::TokenBucket).
///
/// Records live under `"<namespace>:<identity>"` in the shared store, so two
/// limiters sharing a store must use distinct namespaces unless they are
/// meant to share quota.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BucketConfig {
    /// Maximum tokens in a bucket. `0` selects [`DEFAULT_CAPACITY`].
    pub capacity: u32,
    /// Time to accrue one token. Zero selects [`DEFAULT_REFILL_INTERVAL`].
    pub refill_interval: Duration,
    /// Idle expiry for stored records; bounds how many identities the store
    /// tracks. Zero selects [`DEFAULT_RECORD_TTL`].
    pub record_ttl: Duration,
    /// Key prefix in the shared store. Empty selects [`DEFAULT_NAMESPACE`].
    pub namespace: String,
    /// Cap on write-conflict retries per call. `None` retries until the
    /// conditional write lands, matching the unbounded protocol; a cap turns
    /// pathological hot-key contention into
    /// [`BucketError::Contended`](crate::BucketError::Contended).
    pub max_conflict_retries: Option<u32>,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_interval: DEFAULT_REFILL_INTERVAL,
            record_ttl: DEFAULT_RECORD_TTL,
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_conflict_retries: None,
        }
    }
}

impl BucketConfig {
    /// Copy with defaults substituted for zero/empty fields.
    pub fn normalized(mut self) -> Self {
        if self.capacity == 0 {
            self.capacity = DEFAULT_CAPACITY;
        }
        if self.refill_interval.is_zero() {
            self.refill_interval = DEFAULT_REFILL_INTERVAL;
        }
        if self.record_ttl.is_zero() {
            self.record_ttl = DEFAULT_RECORD_TTL;
        }
        if self.namespace.is_empty() {
            self.namespace = DEFAULT_NAMESPACE.to_string();
        }
        self
    }
}
