//! Redis-backed store (single node or cluster).

use super::pool::{Manager, Pool, PoolConfig, PoolState};
use super::{BatchOp, Store, StoreMessage};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use rand::Rng;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, ErrorKind, FromRedisValue, IntoConnectionInfo, RedisError, RedisFuture, Value};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// A connection to either a single node or a cluster.
#[derive(Clone)]
pub enum StoreConnection {
    /// Multiplexed connection to one node.
    Single(MultiplexedConnection),
    /// Slot-aware cluster connection.
    Cluster(ClusterConnection),
}

impl ConnectionLike for StoreConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            Self::Single(conn) => conn.req_packed_command(cmd),
            Self::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a redis::Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            Self::Single(conn) => conn.req_packed_commands(cmd, offset, count),
            Self::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Self::Single(conn) => conn.get_db(),
            Self::Cluster(conn) => conn.get_db(),
        }
    }
}

enum Target {
    Single(redis::Client),
    Cluster(ClusterClient),
}

/// Opens [`StoreConnection`]s for the pool.
pub struct RedisManager {
    target: Target,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl RedisManager {
    /// Build clients from configuration. No connection is opened here.
    pub fn new(config: &StoreConfig) -> StoreResult<Self> {
        let urls = config.node_urls();
        if urls.is_empty() {
            return Err(StoreError::InvalidConfig("no store nodes configured".into()));
        }
        let connect_timeout = config.connect_timeout();
        let response_timeout = Duration::from_secs(config.command_timeout_secs);

        let target = if config.cluster {
            let mut builder = ClusterClient::builder(urls)
                .connection_timeout(connect_timeout)
                .response_timeout(response_timeout)
                .retries(config.max_attempts);
            if let Some(password) = &config.password {
                builder = builder.password(password.clone());
            }
            Target::Cluster(builder.build()?)
        } else {
            Target::Single(single_client(&urls[0], config.password.as_deref())?)
        };

        Ok(Self {
            target,
            connect_timeout,
            response_timeout,
        })
    }

    fn is_cluster(&self) -> bool {
        matches!(self.target, Target::Cluster(_))
    }
}

#[async_trait]
impl Manager for RedisManager {
    type Connection = StoreConnection;

    async fn create(&self) -> StoreResult<StoreConnection> {
        let conn = match &self.target {
            Target::Single(client) => StoreConnection::Single(
                client
                    .get_multiplexed_async_connection_with_timeouts(
                        self.response_timeout,
                        self.connect_timeout,
                    )
                    .await?,
            ),
            Target::Cluster(client) => StoreConnection::Cluster(client.get_async_connection().await?),
        };
        Ok(conn)
    }

    async fn check(&self, conn: &mut StoreConnection) -> StoreResult<()> {
        redis::cmd("PING").query_async::<String>(conn).await?;
        Ok(())
    }
}

fn single_client(url: &str, password: Option<&str>) -> StoreResult<redis::Client> {
    let mut info = url.into_connection_info()?;
    if let Some(password) = password {
        info.redis.password = Some(password.to_string());
    }
    Ok(redis::Client::open(info)?)
}

/// Errors after which the connection is dropped and the command retried:
/// timeouts, resets, refusals, broken pipes and cluster redirects.
pub(crate) fn should_reconnect(err: &RedisError) -> bool {
    err.is_timeout()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_io_error()
        || matches!(err.kind(), ErrorKind::Moved | ErrorKind::ReadOnly)
}

/// Backoff before retry `attempt` (1-based): 30ms per attempt capped at 1s, plus jitter.
pub(crate) fn retry_delay(attempt: u32) -> Duration {
    let base = (u64::from(attempt) * 30).min(1000);
    let jitter = rand::thread_rng().gen_range(0..=base / 4);
    Duration::from_millis(base + jitter)
}

/// Store backed by Redis.
///
/// Single-key commands run on pooled connections. Pipelined batches and
/// publishes share one lazily opened connection, and subscriptions open a
/// dedicated pub/sub connection to the first node (cluster nodes forward
/// classic pub/sub messages to every node).
pub struct RedisStore {
    pool: Pool<RedisManager>,
    shared: RwLock<Option<StoreConnection>>,
    pubsub_client: redis::Client,
    max_attempts: u32,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool", &self.pool)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create the pool, open the minimum idle connections and start maintenance.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let manager = RedisManager::new(config)?;
        let urls = config.node_urls();
        let pubsub_client = single_client(&urls[0], config.password.as_deref())?;
        let cluster = manager.is_cluster();

        let pool = Pool::new(
            manager,
            PoolConfig {
                max_size: config.pool_max_size,
                min_idle: config.pool_min_idle,
                acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
                idle_timeout: Duration::from_secs(config.idle_timeout_secs),
                eviction_interval: Duration::from_secs(config.eviction_interval_secs),
            },
        );

        match pool.fill().await {
            Ok(created) => tracing::info!(
                nodes = urls.len(),
                cluster,
                connections = created,
                "Connected to store"
            ),
            // The driver keeps retrying per command; startup should not fail on a blip.
            Err(e) => tracing::warn!(error = %e, "Initial store connections failed"),
        }
        let maintenance = pool.spawn_maintenance();

        Ok(Self {
            pool,
            shared: RwLock::new(None),
            pubsub_client,
            max_attempts: config.max_attempts.max(1),
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    /// Run a command on a pooled connection, retrying reconnectable errors.
    async fn query<T>(&self, cmd: &Cmd) -> StoreResult<T>
    where
        T: FromRedisValue + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut conn = self.pool.get().await?;
            match cmd.query_async::<T>(&mut *conn).await {
                Ok(value) => return Ok(value),
                Err(e) if should_reconnect(&e) => {
                    conn.discard();
                    drop(conn);
                    if attempt >= self.max_attempts {
                        return Err(e.into());
                    }
                    let delay = retry_delay(attempt);
                    tracing::info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn shared_connection(&self) -> StoreResult<StoreConnection> {
        if let Some(conn) = self.shared.read().await.as_ref() {
            return Ok(conn.clone());
        }
        let mut guard = self.shared.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        tracing::debug!("Opening shared store connection");
        let conn = self.pool.manager().create().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Run an operation on the shared connection, reopening it after
    /// reconnectable errors.
    async fn with_shared<T, F>(&self, mut op: F) -> StoreResult<T>
    where
        F: FnMut(StoreConnection) -> BoxFuture<'static, redis::RedisResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let conn = self.shared_connection().await?;
            match op(conn).await {
                Ok(value) => return Ok(value),
                Err(e) if should_reconnect(&e) => {
                    *self.shared.write().await = None;
                    if attempt >= self.max_attempts {
                        return Err(e.into());
                    }
                    tokio::time::sleep(retry_delay(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.query(redis::cmd("SET").arg(key).arg(value)).await
    }

    async fn set_ex(&self, key: &str, value: &str, secs: u64) -> StoreResult<()> {
        self.query(redis::cmd("SET").arg(key).arg(value).arg("EX").arg(secs))
            .await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let removed: i64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, secs: u64) -> StoreResult<bool> {
        self.query(redis::cmd("EXPIRE").arg(key).arg(secs)).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.query(redis::cmd("INCRBY").arg(key).arg(delta)).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn lset(&self, key: &str, index: isize, value: &str) -> StoreResult<()> {
        self.query(redis::cmd("LSET").arg(key).arg(index).arg(value))
            .await
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> StoreResult<usize> {
        self.query(redis::cmd("LREM").arg(key).arg(count).arg(value))
            .await
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.query(redis::cmd("RPUSH").arg(key).arg(value)).await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.query(redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.query(redis::cmd("HINCRBY").arg(key).arg(field).arg(delta))
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for op in &ops {
            match op {
                BatchOp::Del(key) => pipe.cmd("DEL").arg(key).ignore(),
                BatchOp::RPush { key, values } => pipe.cmd("RPUSH").arg(key).arg(values).ignore(),
                BatchOp::LPush { key, values } => pipe.cmd("LPUSH").arg(key).arg(values).ignore(),
                BatchOp::Expire { key, secs } => pipe.cmd("EXPIRE").arg(key).arg(*secs).ignore(),
                BatchOp::SetEx { key, value, secs } => pipe
                    .cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(*secs)
                    .ignore(),
            };
        }
        self.with_shared(|mut conn| {
            let pipe = pipe.clone();
            async move { pipe.query_async::<()>(&mut conn).await }.boxed()
        })
        .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(payload);
        self.with_shared(|mut conn| {
            let cmd = cmd.clone();
            async move { cmd.query_async::<()>(&mut conn).await }.boxed()
        })
        .await
    }

    async fn subscribe(&self, pattern: &str) -> StoreResult<BoxStream<'static, StoreMessage>> {
        let mut pubsub = self.pubsub_client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        tracing::info!(pattern, "Subscribed to store channel pattern");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload = msg.get_payload::<String>().ok()?;
            Some(StoreMessage {
                channel: msg.get_channel_name().to_string(),
                payload,
            })
        });
        Ok(stream.boxed())
    }

    fn pool_state(&self) -> Option<PoolState> {
        Some(self.pool.state())
    }

    async fn close(&self) {
        if let Some(handle) = self
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        *self.shared.write().await = None;
        self.pool.close();
        tracing::info!("Store connections closed");
    }

    fn backend(&self) -> &'static str {
        if self.pool.manager().is_cluster() {
            "redis-cluster"
        } else {
            "redis"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirects_and_network_errors_trigger_reconnect() {
        assert!(should_reconnect(&RedisError::from((ErrorKind::Moved, "MOVED"))));
        assert!(should_reconnect(&RedisError::from((ErrorKind::ReadOnly, "READONLY"))));
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(should_reconnect(&RedisError::from(refused)));
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(should_reconnect(&RedisError::from(reset)));
    }

    #[test]
    fn command_errors_do_not_trigger_reconnect() {
        assert!(!should_reconnect(&RedisError::from((ErrorKind::TypeError, "WRONGTYPE"))));
        assert!(!should_reconnect(&RedisError::from((
            ErrorKind::ResponseError,
            "ERR index out of range"
        ))));
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let first = retry_delay(1);
        assert!(first >= Duration::from_millis(30) && first <= Duration::from_millis(37));
        let late = retry_delay(100);
        assert!(late >= Duration::from_millis(1000) && late <= Duration::from_millis(1250));
    }

    #[test]
    fn manager_requires_nodes() {
        let err = RedisManager::new(&StoreConfig::default()).err().unwrap();
        assert!(matches!(err, StoreError::InvalidConfig(_)));
    }

    #[test]
    fn manager_builds_without_connecting() {
        let single = StoreConfig {
            nodes: vec!["redis://127.0.0.1:6390".into()],
            password: Some("secret".into()),
            ..StoreConfig::default()
        };
        assert!(!RedisManager::new(&single).unwrap().is_cluster());

        let cluster = StoreConfig {
            nodes: vec!["redis://127.0.0.1:7000".into(), "redis://127.0.0.1:7001".into()],
            cluster: true,
            ..StoreConfig::default()
        };
        assert!(RedisManager::new(&cluster).unwrap().is_cluster());
    }
}
