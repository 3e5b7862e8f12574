//! Redis realization of the floodgate store capability (companion crate).
//! Bring your own [`redis::aio::ConnectionManager`], or let
//! [`RedisStore::connect`] build one and verify it with a PING.
//!
//! Conditional writes run as a single atomic server-side script: the new
//! record lands only if the key still holds the value observed when the
//! watch began. That is the same guarantee a WATCH/MULTI/EXEC transaction
//! gives this protocol, without per-connection watch state, so it composes
//! with a shared multiplexed connection. A value-level swap back to identical
//! bytes is indistinguishable from "unchanged", which is harmless here: the
//! bytes are the entire decision input.

use async_trait::async_trait;
use floodgate::store::{BucketStore, Commit, StoreTxn};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

/// Write ARGV[2] under KEYS[1] with TTL ARGV[3] (milliseconds) iff the key
/// still holds ARGV[1]. An absent key is observed as the empty string, which
/// the record codec can never emit.
const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if cur == false then
  cur = ''
end
if cur == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
  return 1
end
return 0
"#;

/// [`BucketStore`] over Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    script: Arc<redis::Script>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("conn", &"<redis::aio::ConnectionManager>").finish()
    }
}

impl RedisStore {
    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn, script: Arc::new(redis::Script::new(CAS_SCRIPT)) }
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`) and verify liveness
    /// with a PING before returning.
    pub async fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::debug!(target: "floodgate::redis", url = %url, "connected to redis");
        Ok(Self::new(conn))
    }
}

/// One optimistic transaction against [`RedisStore`].
pub struct RedisTxn {
    conn: ConnectionManager,
    script: Arc<redis::Script>,
    key: String,
    observed: Option<String>,
}

impl std::fmt::Debug for RedisTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTxn")
            .field("key", &self.key)
            .field("observed", &self.observed)
            .finish()
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    type Error = redis::RedisError;
    type Txn = RedisTxn;

    async fn watch(&self, key: &str) -> Result<RedisTxn, Self::Error> {
        let mut conn = self.conn.clone();
        let observed: Option<String> = conn.get(key).await?;
        Ok(RedisTxn {
            conn,
            script: Arc::clone(&self.script),
            key: key.to_string(),
            observed,
        })
    }
}

#[async_trait]
impl StoreTxn for RedisTxn {
    type Error = redis::RedisError;

    fn current(&self) -> Option<&str> {
        self.observed.as_deref()
    }

    async fn commit(mut self, value: &str, ttl: Duration) -> Result<Commit, Self::Error> {
        // SET PX rejects 0, and a record that expires immediately is useless.
        let px = ttl.as_millis().max(1) as u64;
        let committed: i64 = self
            .script
            .key(self.key.as_str())
            .arg(self.observed.as_deref().unwrap_or(""))
            .arg(value)
            .arg(px)
            .invoke_async(&mut self.conn)
            .await?;
        Ok(if committed == 1 { Commit::Committed } else { Commit::Conflict })
    }

    async fn discard(self) -> Result<(), Self::Error> {
        // The compare-and-swap keeps no server-side watch state to release.
        Ok(())
    }
}
