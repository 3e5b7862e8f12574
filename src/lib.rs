#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Distributed, per-identity token-bucket rate limiting over a shared
//! key-value store. Many independent server processes converge on a single
//! correct admit/reject decision per request without a distributed lock: each
//! call reads the identity's quota record under a watch, refills it lazily
//! from elapsed time, and commits the decremented record through a
//! conditional write that fails if a racing process got there first.
//!
//! ## Pieces
//!
//! - [`TokenBucket`]: the admission driver (`try_consume`).
//! - [`BucketStore`]: the storage capability; [`InMemoryStore`] for tests and
//!   single-process use, `floodgate-redis` for the real thing.
//! - [`RateLimitLayer`]: tower middleware gating a service per identity.
//! - [`Clock`]: injectable time source, so refill math is testable without
//!   real delays.
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::{BucketConfig, Decision, InMemoryStore, TokenBucket};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bucket = TokenBucket::new(InMemoryStore::new(), BucketConfig::default());
//!
//! match bucket.try_consume("203.0.113.7").await.unwrap() {
//!     Decision::Admitted { remaining } => println!("admitted, {remaining} tokens left"),
//!     Decision::Rejected { retry_after } => println!("over quota, retry in {retry_after:?}"),
//! }
//! # });
//! ```

pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
pub mod record;
pub mod refill;
pub mod store;

// Re-exports
pub use bucket::{Decision, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::BucketConfig;
pub use error::BucketError;
pub use middleware::{LimitError, RateLimitLayer, RateLimitService};
pub use record::{QuotaRecord, RecordError};
pub use store::{BucketStore, Commit, InMemoryStore, StoreTxn};
