//! In-process store.
//!
//! Mirrors the subset of Redis semantics the relay relies on (expiry, list
//! positional writes, hash counters, pattern pub/sub) so that several relay
//! instances in one process, or one instance without a Redis deployment,
//! behave like a real cluster. Expired keys are removed lazily on access.

use super::{glob_match, BatchOp, Store, StoreMessage};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::{DashMap, DashSet};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const PUBSUB_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Data {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(data: Data) -> Self {
        Self {
            data,
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Store held in process memory. Cloning shares the same data.
#[derive(Clone)]
pub struct MemoryStore {
    data: Arc<DashMap<String, Entry>>,
    events: broadcast::Sender<StoreMessage>,
    failing: Arc<AtomicBool>,
    read_only_keys: Arc<DashSet<String>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            data: Arc::new(DashMap::new()),
            events,
            failing: Arc::new(AtomicBool::new(false)),
            read_only_keys: Arc::new(DashSet::new()),
        }
    }

    /// Make every subsequent operation fail as if the store were unreachable.
    pub fn fail_requests(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make writes to one key fail while reads and other keys keep working.
    pub fn fail_writes_to(&self, key: &str, failing: bool) {
        if failing {
            self.read_only_keys.insert(key.to_string());
        } else {
            self.read_only_keys.remove(key);
        }
    }

    /// Whether a live key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.purge_if_expired(key);
        self.data.contains_key(key)
    }

    /// Remaining time to live of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.purge_if_expired(key);
        self.data
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Live keys matching a glob pattern.
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|e| !e.value().is_expired() && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Driver(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "store unavailable",
            ))));
        }
        Ok(())
    }

    fn check_writable(&self, key: &str) -> StoreResult<()> {
        self.check_available()?;
        if self.read_only_keys.contains(key) {
            return Err(StoreError::Driver(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "write failed",
            ))));
        }
        Ok(())
    }

    fn purge_if_expired(&self, key: &str) {
        self.data.remove_if(key, |_, entry| entry.is_expired());
    }

    /// Entry for a key with expired values treated as absent.
    fn live_entry(&self, key: &str) -> MapEntry<'_, String, Entry> {
        self.purge_if_expired(key);
        self.data.entry(key.to_string())
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::WrongType {
            key: key.to_string(),
        }
    }

    fn set_value(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.data.insert(
            key.to_string(),
            Entry {
                data: Data::Str(value.to_string()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    fn push_values(&self, key: &str, values: &[String]) -> StoreResult<usize> {
        match self.live_entry(key) {
            MapEntry::Occupied(mut occupied) => match &mut occupied.get_mut().data {
                Data::List(list) => {
                    list.extend(values.iter().cloned());
                    Ok(list.len())
                }
                _ => Err(Self::wrong_type(key)),
            },
            MapEntry::Vacant(vacant) => {
                let list: VecDeque<String> = values.iter().cloned().collect();
                let len = list.len();
                vacant.insert(Entry::new(Data::List(list)));
                Ok(len)
            }
        }
    }

    fn prepend_values(&self, key: &str, values: &[String]) -> StoreResult<usize> {
        match self.live_entry(key) {
            MapEntry::Occupied(mut occupied) => match &mut occupied.get_mut().data {
                Data::List(list) => {
                    for value in values {
                        list.push_front(value.clone());
                    }
                    Ok(list.len())
                }
                _ => Err(Self::wrong_type(key)),
            },
            MapEntry::Vacant(vacant) => {
                let list: VecDeque<String> = values.iter().rev().cloned().collect();
                let len = list.len();
                vacant.insert(Entry::new(Data::List(list)));
                Ok(len)
            }
        }
    }

    fn set_expiry(&self, key: &str, secs: u64) -> bool {
        self.purge_if_expired(key);
        match self.data.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(secs));
                true
            }
            None => false,
        }
    }
}

/// Resolve a Redis-style index (negative counts from the end).
fn resolve_index(len: usize, index: isize) -> Option<usize> {
    let resolved = if index < 0 {
        len as isize + index
    } else {
        index
    };
    (0..len as isize).contains(&resolved).then_some(resolved as usize)
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        self.purge_if_expired(key);
        match self.data.get(key).map(|e| e.data.clone()) {
            Some(Data::Str(s)) => Ok(Some(s)),
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check_writable(key)?;
        self.set_value(key, value, None);
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, secs: u64) -> StoreResult<()> {
        self.check_writable(key)?;
        self.set_value(key, value, Some(Duration::from_secs(secs)));
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.check_writable(key)?;
        self.purge_if_expired(key);
        Ok(self.data.remove(key).is_some())
    }

    async fn expire(&self, key: &str, secs: u64) -> StoreResult<bool> {
        self.check_writable(key)?;
        Ok(self.set_expiry(key, secs))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.check_writable(key)?;
        match self.live_entry(key) {
            MapEntry::Occupied(mut occupied) => match &mut occupied.get_mut().data {
                Data::Str(s) => {
                    let current: i64 = s.parse().map_err(|_| Self::wrong_type(key))?;
                    let next = current + delta;
                    *s = next.to_string();
                    Ok(next)
                }
                _ => Err(Self::wrong_type(key)),
            },
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(Data::Str(delta.to_string())));
                Ok(delta)
            }
        }
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        self.check_available()?;
        self.purge_if_expired(key);
        let Some(entry) = self.data.get(key) else {
            return Ok(Vec::new());
        };
        let Data::List(list) = &entry.data else {
            return Err(Self::wrong_type(key));
        };
        let len = list.len() as isize;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn lset(&self, key: &str, index: isize, value: &str) -> StoreResult<()> {
        self.check_writable(key)?;
        self.purge_if_expired(key);
        let Some(mut entry) = self.data.get_mut(key) else {
            return Err(StoreError::IndexOutOfRange {
                key: key.to_string(),
                index,
            });
        };
        let Data::List(list) = &mut entry.data else {
            return Err(Self::wrong_type(key));
        };
        let slot = resolve_index(list.len(), index)
            .and_then(|i| list.get_mut(i))
            .ok_or_else(|| StoreError::IndexOutOfRange {
                key: key.to_string(),
                index,
            })?;
        *slot = value.to_string();
        Ok(())
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> StoreResult<usize> {
        self.check_writable(key)?;
        self.purge_if_expired(key);
        let removed = {
            let Some(mut entry) = self.data.get_mut(key) else {
                return Ok(0);
            };
            let Data::List(list) = &mut entry.data else {
                return Err(Self::wrong_type(key));
            };
            let limit = if count == 0 {
                usize::MAX
            } else {
                count.unsigned_abs()
            };
            let mut removed = 0;
            if count >= 0 {
                let mut i = 0;
                while i < list.len() && removed < limit {
                    if list[i] == value {
                        list.remove(i);
                        removed += 1;
                    } else {
                        i += 1;
                    }
                }
            } else {
                let mut i = list.len();
                while i > 0 && removed < limit {
                    i -= 1;
                    if list[i] == value {
                        list.remove(i);
                        removed += 1;
                    }
                }
            }
            removed
        };
        // Redis deletes lists that become empty.
        self.data
            .remove_if(key, |_, e| matches!(&e.data, Data::List(l) if l.is_empty()));
        Ok(removed)
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.check_writable(key)?;
        self.push_values(key, &[value.to_string()])
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        self.purge_if_expired(key);
        match self.data.get(key).as_deref().map(|e| &e.data) {
            Some(Data::Hash(map)) => Ok(map.get(field).cloned()),
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.check_writable(key)?;
        match self.live_entry(key) {
            MapEntry::Occupied(mut occupied) => match &mut occupied.get_mut().data {
                Data::Hash(map) => {
                    map.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                _ => Err(Self::wrong_type(key)),
            },
            MapEntry::Vacant(vacant) => {
                let mut map = HashMap::new();
                map.insert(field.to_string(), value.to_string());
                vacant.insert(Entry::new(Data::Hash(map)));
                Ok(())
            }
        }
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.check_writable(key)?;
        match self.live_entry(key) {
            MapEntry::Occupied(mut occupied) => match &mut occupied.get_mut().data {
                Data::Hash(map) => {
                    let current: i64 = match map.get(field) {
                        Some(raw) => raw.parse().map_err(|_| Self::wrong_type(key))?,
                        None => 0,
                    };
                    let next = current + delta;
                    map.insert(field.to_string(), next.to_string());
                    Ok(next)
                }
                _ => Err(Self::wrong_type(key)),
            },
            MapEntry::Vacant(vacant) => {
                let mut map = HashMap::new();
                map.insert(field.to_string(), delta.to_string());
                vacant.insert(Entry::new(Data::Hash(map)));
                Ok(delta)
            }
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> StoreResult<()> {
        self.check_available()?;
        for op in ops {
            match op {
                BatchOp::Del(key) => {
                    self.data.remove(&key);
                }
                BatchOp::RPush { key, values } => {
                    self.push_values(&key, &values)?;
                }
                BatchOp::LPush { key, values } => {
                    self.prepend_values(&key, &values)?;
                }
                BatchOp::Expire { key, secs } => {
                    self.set_expiry(&key, secs);
                }
                BatchOp::SetEx { key, value, secs } => {
                    self.set_value(&key, &value, Some(Duration::from_secs(secs)));
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        self.check_available()?;
        // No subscribers is not an error.
        let _ = self.events.send(StoreMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> StoreResult<BoxStream<'static, StoreMessage>> {
        self.check_available()?;
        let rx = self.events.subscribe();
        let pattern = pattern.to_string();
        let stream = stream::unfold(rx, move |mut rx| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) if glob_match(&pattern, &msg.channel) => return Some((msg, rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "In-process subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strings_and_expiry() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", 60).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.ttl("k").unwrap() <= Duration::from_secs(60));

        store.set_ex("gone", "v", 0).await.unwrap();
        assert_eq!(store.get("gone").await.unwrap(), None);
        assert!(!store.contains("gone"));

        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn expire_reports_missing_keys() {
        let store = MemoryStore::new();
        assert!(!store.expire("missing", 10).await.unwrap());
        store.set("present", "1").await.unwrap();
        assert!(store.ttl("present").is_none());
        assert!(store.expire("present", 10).await.unwrap());
        assert!(store.ttl("present").is_some());
    }

    #[tokio::test]
    async fn counters() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("c", 2).await.unwrap(), 2);
        assert_eq!(store.incr_by("c", -3).await.unwrap(), -1);
        assert_eq!(store.hincr_by("h", "n", 1).await.unwrap(), 1);
        assert_eq!(store.hincr_by("h", "n", 1).await.unwrap(), 2);
        store.hset("h", "ts", "100").await.unwrap();
        assert_eq!(store.hget("h", "ts").await.unwrap().as_deref(), Some("100"));
        assert!(store.hincr_by("h", "ts", 1).await.is_ok());
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.rpush("list", "a").await.unwrap();
        assert!(matches!(
            store.get("list").await,
            Err(StoreError::WrongType { .. })
        ));
        assert!(store.hget("list", "f").await.is_err());
    }

    #[tokio::test]
    async fn list_operations() {
        let store = MemoryStore::new();
        for v in ["a", "b", "c", "b"] {
            store.rpush("l", v).await.unwrap();
        }
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["a", "b", "c", "b"]);
        assert_eq!(store.lrange("l", 1, 2).await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.lrange("l", -2, -1).await.unwrap(), vec!["c", "b"]);
        assert!(store.lrange("l", 5, 10).await.unwrap().is_empty());

        store.lset("l", -1, "z").await.unwrap();
        assert!(matches!(
            store.lset("l", 9, "x").await,
            Err(StoreError::IndexOutOfRange { .. })
        ));

        assert_eq!(store.lrem("l", 1, "b").await.unwrap(), 1);
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["a", "c", "z"]);
        assert_eq!(store.lrem("l", 0, "missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_lists_are_deleted() {
        let store = MemoryStore::new();
        store.rpush("l", "only").await.unwrap();
        store.lrem("l", 1, "only").await.unwrap();
        assert!(!store.contains("l"));
    }

    #[tokio::test]
    async fn batch_applies_in_order() {
        let store = MemoryStore::new();
        store.rpush("dst", "stale").await.unwrap();
        store
            .write_batch(vec![
                BatchOp::Del("dst".into()),
                BatchOp::RPush {
                    key: "dst".into(),
                    values: vec!["1".into(), "2".into()],
                },
                BatchOp::Expire {
                    key: "dst".into(),
                    secs: 30,
                },
                BatchOp::SetEx {
                    key: "s".into(),
                    value: "v".into(),
                    secs: 30,
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.lrange("dst", 0, -1).await.unwrap(), vec!["1", "2"]);
        assert!(store.ttl("dst").is_some());
        assert_eq!(store.get("s").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn batch_prepend_keeps_existing_tail() {
        let store = MemoryStore::new();
        store.rpush("q", "new").await.unwrap();
        store
            .write_batch(vec![BatchOp::LPush {
                key: "q".into(),
                values: vec!["2".into(), "1".into()],
            }])
            .await
            .unwrap();
        assert_eq!(store.lrange("q", 0, -1).await.unwrap(), vec!["1", "2", "new"]);

        store
            .write_batch(vec![BatchOp::LPush {
                key: "fresh".into(),
                values: vec!["b".into(), "a".into()],
            }])
            .await
            .unwrap();
        assert_eq!(store.lrange("fresh", 0, -1).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn pubsub_filters_by_pattern() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("relay#*").await.unwrap();

        store.publish("other", "ignored").await.unwrap();
        store.publish("relay#room", "hello").await.unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.channel, "relay#room");
        assert_eq!(msg.payload, "hello");
    }

    #[tokio::test]
    async fn clones_share_data() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.set("shared", "yes").await.unwrap();
        assert_eq!(b.get("shared").await.unwrap().as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn failure_injection() {
        let store = MemoryStore::new();
        store.fail_requests(true);
        assert!(store.ping().await.is_err());
        assert!(store.get("k").await.is_err());
        store.fail_requests(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn write_failure_on_one_key() {
        let store = MemoryStore::new();
        store.hincr_by("h", "n", 1).await.unwrap();
        store.fail_writes_to("h", true);
        assert!(store.hincr_by("h", "n", 1).await.is_err());
        assert_eq!(store.hget("h", "n").await.unwrap().as_deref(), Some("1"));
        assert!(store.set("other", "v").await.is_ok());
        store.fail_writes_to("h", false);
        assert_eq!(store.hincr_by("h", "n", 1).await.unwrap(), 2);
    }

    #[test]
    fn index_resolution() {
        assert_eq!(resolve_index(3, 0), Some(0));
        assert_eq!(resolve_index(3, -1), Some(2));
        assert_eq!(resolve_index(3, 3), None);
        assert_eq!(resolve_index(3, -4), None);
        assert_eq!(resolve_index(0, 0), None);
    }
}
