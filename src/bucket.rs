//! The optimistic admission driver.
//!
//! `TokenBucket` holds no in-process cache and no sync primitives: a mutex
//! would only coordinate threads inside one process, and the whole point of
//! the shared store is coordination between independent server instances.
//! Every call re-reads authoritative state and commits through a conditional
//! write, retrying from a fresh read when a racing writer wins.

use crate::clock::{Clock, SystemClock};
use crate::config::BucketConfig;
use crate::error::BucketError;
use crate::record::QuotaRecord;
use crate::refill::refill;
use crate::store::{BucketStore, Commit, StoreTxn};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// The three-way outcome of an admission check, minus failures (those travel
/// through `Result::Err`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A token was consumed; the request may proceed.
    Admitted {
        /// Tokens left after this consumption. Feeds `X-RateLimit-Remaining`.
        remaining: u32,
    },
    /// The bucket is empty. Nothing was written; rejection never perturbs
    /// stored state.
    Rejected {
        /// Time until the next token accrues. Feeds `Retry-After`.
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }
}

/// Distributed token bucket over a [`BucketStore`].
///
/// One instance serves any number of identities; records for different
/// identities live under independent keys and never contend with each other.
#[derive(Debug)]
pub struct TokenBucket<S, C = SystemClock> {
    store: S,
    clock: C,
    capacity: u32,
    refill_interval: Duration,
    record_ttl: Duration,
    namespace: String,
    max_conflict_retries: Option<u32>,
}

impl<S: BucketStore> TokenBucket<S> {
    /// Build a bucket on the system clock. Zero/empty config fields fall back
    /// to the documented defaults.
    pub fn new(store: S, config: BucketConfig) -> Self {
        Self::with_clock(store, config, SystemClock)
    }
}

impl<S: BucketStore, C: Clock> TokenBucket<S, C> {
    /// Build a bucket on an explicit clock, for deterministic tests.
    pub fn with_clock(store: S, config: BucketConfig, clock: C) -> Self {
        let config = config.normalized();
        Self {
            store,
            clock,
            capacity: config.capacity,
            refill_interval: config.refill_interval,
            record_ttl: config.record_ttl,
            namespace: config.namespace,
            max_conflict_retries: config.max_conflict_retries,
        }
    }

    /// Maximum tokens per identity.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Time to accrue one token.
    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Store key for an identity.
    fn key(&self, identity: &str) -> String {
        format!("{}:{}", self.namespace, identity)
    }

    /// Try to consume one token for `identity`.
    ///
    /// Reads the identity's record under a watch, refills it from elapsed
    /// time, and commits the decremented record through a conditional write.
    /// A write conflict means another process committed first; the decision
    /// is then recomputed from a fresh read, so no admission is ever based on
    /// stale data. Conflicts retry indefinitely unless
    /// [`BucketConfig::max_conflict_retries`] caps them; every other store
    /// error surfaces immediately.
    ///
    /// Cancellation propagates through the store futures: dropping this
    /// future abandons the in-flight read or write.
    pub async fn try_consume(&self, identity: &str) -> Result<Decision, BucketError<S::Error>> {
        let key = self.key(identity);
        let mut conflicts: u32 = 0;
        loop {
            let txn = self.store.watch(&key).await.map_err(BucketError::Store)?;
            let now = self.clock.now();
            let record = match txn.current() {
                // Fresh or expired identity: a full bucket anchored at now.
                None => QuotaRecord { tokens: self.capacity, refilled_at: now },
                Some(raw) => match QuotaRecord::decode(raw) {
                    Ok(stored) => {
                        let (tokens, refilled_at) = refill(
                            stored.tokens,
                            stored.refilled_at,
                            now,
                            self.capacity,
                            self.refill_interval,
                        );
                        QuotaRecord { tokens, refilled_at }
                    }
                    Err(e) => {
                        // Corruption, not contention: retrying cannot help.
                        let _ = txn.discard().await;
                        return Err(BucketError::Malformed(e));
                    }
                },
            };

            if record.tokens == 0 {
                txn.discard().await.map_err(BucketError::Store)?;
                let retry_after = self.until_next_token(record.refilled_at, now);
                return Ok(Decision::Rejected { retry_after });
            }

            let next = QuotaRecord { tokens: record.tokens - 1, refilled_at: record.refilled_at };
            match txn.commit(&next.encode(), self.record_ttl).await.map_err(BucketError::Store)? {
                Commit::Committed => return Ok(Decision::Admitted { remaining: next.tokens }),
                Commit::Conflict => {
                    conflicts += 1;
                    if let Some(cap) = self.max_conflict_retries {
                        if conflicts > cap {
                            return Err(BucketError::Contended { attempts: conflicts });
                        }
                    }
                }
            }
        }
    }

    /// Remaining wait until one token accrues, given a record that just went
    /// through refill at `now` and came out empty.
    fn until_next_token(&self, refilled_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        match now.signed_duration_since(refilled_at).to_std() {
            Ok(elapsed) => self.refill_interval.saturating_sub(elapsed),
            Err(_) => self.refill_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn config(capacity: u32) -> BucketConfig {
        BucketConfig {
            capacity,
            refill_interval: Duration::from_secs(10),
            record_ttl: Duration::from_secs(60),
            namespace: "t".to_string(),
            max_conflict_retries: None,
        }
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    #[tokio::test]
    async fn malformed_record_surfaces_without_retry() {
        let store = InMemoryStore::new();
        let seeded = store.watch("t:alice").await.unwrap();
        seeded.commit("tokens went missing", Duration::from_secs(60)).await.unwrap();

        let bucket = TokenBucket::with_clock(store.clone(), config(3), clock());
        let err = bucket.try_consume("alice").await.unwrap_err();
        assert!(err.is_malformed());
        // The corrupt value must still be there, untouched.
        assert_eq!(store.peek("t:alice"), Some("tokens went missing".to_string()));
    }

    #[tokio::test]
    async fn rejection_reports_time_to_next_token() {
        let store = InMemoryStore::new();
        let clock = clock();
        let bucket = TokenBucket::with_clock(store, config(1), clock.clone());

        assert!(bucket.try_consume("alice").await.unwrap().is_admitted());
        clock.advance(Duration::from_secs(4));
        match bucket.try_consume("alice").await.unwrap() {
            Decision::Rejected { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(6));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn keys_are_namespaced_per_identity() {
        let store = InMemoryStore::new();
        let bucket = TokenBucket::with_clock(store.clone(), config(2), clock());
        bucket.try_consume("alice").await.unwrap();
        assert!(store.peek("t:alice").is_some());
        assert!(store.peek("t:bob").is_none());
    }

    /// Store whose conditional writes always lose the race.
    #[derive(Debug, Clone, Default)]
    struct AlwaysConflicting;

    #[derive(Debug)]
    struct ConflictTxn;

    #[async_trait]
    impl BucketStore for AlwaysConflicting {
        type Error = std::convert::Infallible;
        type Txn = ConflictTxn;

        async fn watch(&self, _key: &str) -> Result<ConflictTxn, Self::Error> {
            Ok(ConflictTxn)
        }
    }

    #[async_trait]
    impl StoreTxn for ConflictTxn {
        type Error = std::convert::Infallible;

        fn current(&self) -> Option<&str> {
            None
        }

        async fn commit(self, _value: &str, _ttl: Duration) -> Result<Commit, Self::Error> {
            Ok(Commit::Conflict)
        }

        async fn discard(self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn conflict_cap_surfaces_contention() {
        let mut cfg = config(3);
        cfg.max_conflict_retries = Some(4);
        let bucket = TokenBucket::with_clock(AlwaysConflicting, cfg, clock());
        match bucket.try_consume("alice").await.unwrap_err() {
            BucketError::Contended { attempts } => assert_eq!(attempts, 5),
            other => panic!("expected contention, got {:?}", other),
        }
    }
}
