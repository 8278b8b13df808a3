//! Shared store layer.
//!
//! Every piece of cross-connection state (channel configs, message queues,
//! occupancy counters) lives behind the [`Store`] trait so any number of relay
//! instances can serve the same channels. Two backends exist:
//!
//! - [`RedisStore`]: pooled connections to a Redis node or cluster
//! - [`MemoryStore`]: in-process maps for single-instance development and tests

pub mod health;
mod memory;
pub mod pool;
mod redis_store;

pub use self::memory::MemoryStore;
pub use redis_store::{RedisManager, RedisStore, StoreConnection};
pub use pool::{Pool, PoolConfig, PoolState};

use crate::config::StoreConfig;
use crate::error::StoreResult;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// A message received on a pub/sub subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload.
    pub payload: String,
}

/// One write in a pipelined batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Delete a key.
    Del(String),
    /// Append values to a list.
    RPush {
        /// List key.
        key: String,
        /// Values in append order.
        values: Vec<String>,
    },
    /// Prepend values to a list. As with LPUSH, the last value ends up first.
    LPush {
        /// List key.
        key: String,
        /// Values in push order.
        values: Vec<String>,
    },
    /// Set a TTL in seconds.
    Expire {
        /// Key.
        key: String,
        /// TTL in seconds.
        secs: u64,
    },
    /// Set a value with a TTL in seconds.
    SetEx {
        /// Key.
        key: String,
        /// Value.
        value: String,
        /// TTL in seconds.
        secs: u64,
    },
}

/// Key-value, list, hash and pub/sub primitives used by the relay.
///
/// Every call is a single round-trip that acquires a connection and releases
/// it on every exit path. [`Store::write_batch`], [`Store::publish`] and
/// [`Store::subscribe`] go through a long-lived shared connection instead.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// GET
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    /// SET
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    /// SET with EX
    async fn set_ex(&self, key: &str, value: &str, secs: u64) -> StoreResult<()>;
    /// DEL; returns whether the key existed.
    async fn del(&self, key: &str) -> StoreResult<bool>;
    /// EXPIRE; returns whether the key exists.
    async fn expire(&self, key: &str, secs: u64) -> StoreResult<bool>;
    /// INCRBY
    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64>;
    /// LRANGE (inclusive bounds, negative indices count from the end)
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;
    /// LSET
    async fn lset(&self, key: &str, index: isize, value: &str) -> StoreResult<()>;
    /// LREM; returns the number of removed entries.
    async fn lrem(&self, key: &str, count: isize, value: &str) -> StoreResult<usize>;
    /// RPUSH; returns the new list length.
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<usize>;
    /// HGET
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    /// HSET
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;
    /// HINCRBY
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;
    /// Liveness probe.
    async fn ping(&self) -> StoreResult<()>;
    /// Apply writes in order as one pipeline.
    async fn write_batch(&self, ops: Vec<BatchOp>) -> StoreResult<()>;
    /// PUBLISH
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;
    /// PSUBSCRIBE; the stream ends when the subscription is lost.
    async fn subscribe(&self, pattern: &str) -> StoreResult<BoxStream<'static, StoreMessage>>;

    /// Connection pool occupancy, when the backend is pooled.
    fn pool_state(&self) -> Option<PoolState> {
        None
    }

    /// Close connections during shutdown.
    async fn close(&self) {}

    /// Backend name for logs and health output.
    fn backend(&self) -> &'static str;
}

/// Build the store selected by configuration.
///
/// With no nodes configured the in-process store is used; this only works
/// for a single relay instance.
pub async fn connect(config: &StoreConfig) -> StoreResult<Arc<dyn Store>> {
    if config.nodes.is_empty() {
        tracing::warn!("No store nodes configured, using in-process store (single instance only)");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = RedisStore::connect(config).await?;
    Ok(Arc::new(store))
}

/// Glob match for pub/sub patterns (`*` and `?`).
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pb = pattern.as_bytes();
    let tb = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < tb.len() {
        match pb.get(pi) {
            Some(b'*') => {
                backtrack = Some((pi, ti));
                pi += 1;
            }
            Some(&c) if c == b'?' || c == tb[ti] => {
                pi += 1;
                ti += 1;
            }
            _ => match backtrack {
                Some((star_p, star_t)) => {
                    pi = star_p + 1;
                    ti = star_t + 1;
                    backtrack = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }
    pb[pi..].iter().all(|&c| c == b'*')
}
