//! Size-bounded cache with single-flight fetch coalescing.
//!
//! [`SingleFlightCache`] wraps a weighted `moka` cache with an in-flight
//! registry: the first caller to miss on a key starts the fetch and
//! broadcasts the outcome over a `watch` channel; concurrent callers for the
//! same key await that channel instead of fetching again. The registry entry
//! is removed when the fetch completes (success or failure) or when the
//! fetching task is cancelled, so later callers always retry cleanly —
//! a failed fetch never poisons its key.

use bale_core::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moka::sync::Cache;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::watch;

type FlightReceiver<V> = watch::Receiver<Option<Result<V>>>;

pub struct SingleFlightCache<K, V>
where
    K: Hash + Eq + Send + Sync + Clone + 'static,
    V: Clone + Send + Sync + 'static,
{
    name: &'static str,
    cache: Cache<K, V>,
    in_flight: Arc<DashMap<K, FlightReceiver<V>>>,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Hash + Eq + Send + Sync + Clone + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// A cache bounded by total weight (typically bytes).
    pub fn weighted(name: &'static str, max_weight: u64, weigher: fn(&K, &V) -> u32) -> Self {
        Self {
            name,
            cache: Cache::builder()
                .max_capacity(max_weight)
                .weigher(weigher)
                .build(),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// A cache bounded by entry count.
    pub fn counted(name: &'static str, max_entries: u64) -> Self {
        Self {
            name,
            cache: Cache::builder().max_capacity(max_entries).build(),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Non-coalescing lookup.
    pub fn get(&self, key: &K) -> Option<V> {
        self.cache.get(key)
    }

    /// Look the key up, coalescing concurrent misses into one `fetch` call.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut fetch = Some(fetch);
        loop {
            if let Some(value) = self.cache.get(&key) {
                return Ok(value);
            }
            match self.in_flight.entry(key.clone()) {
                Entry::Occupied(occupied) => {
                    let rx = occupied.get().clone();
                    drop(occupied);
                    tracing::trace!(cache = self.name, "awaiting in-flight fetch");
                    match Self::await_flight(rx).await {
                        Some(result) => return result,
                        // The fetching task was cancelled before broadcasting
                        // a result; start over.
                        None => continue,
                    }
                }
                Entry::Vacant(vacant) => {
                    let fetch = fetch
                        .take()
                        .ok_or_else(|| Error::usage("single-flight fetch restarted"))?;
                    let (tx, rx) = watch::channel(None);
                    vacant.insert(rx);
                    // Removes the registry entry even if this future is
                    // dropped mid-fetch.
                    let _guard = FlightGuard {
                        map: &self.in_flight,
                        key: key.clone(),
                    };
                    tracing::trace!(cache = self.name, "fetching");
                    let result = fetch().await;
                    if let Ok(value) = &result {
                        self.cache.insert(key.clone(), value.clone());
                    }
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    async fn await_flight(mut rx: FlightReceiver<V>) -> Option<Result<V>> {
        loop {
            if let Some(result) = rx.borrow_and_update().as_ref() {
                return Some(result.clone());
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

impl<K, V> std::fmt::Debug for SingleFlightCache<K, V>
where
    K: Hash + Eq + Send + Sync + Clone + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlightCache")
            .field("name", &self.name)
            .field("entries", &self.cache.entry_count())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

struct FlightGuard<'a, K, V>
where
    K: Hash + Eq,
{
    map: &'a DashMap<K, FlightReceiver<V>>,
    key: K,
}

impl<K, V> Drop for FlightGuard<'_, K, V>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn byte_cache(max: u64) -> SingleFlightCache<String, Arc<Vec<u8>>> {
        SingleFlightCache::weighted("test", max, |_, v| v.len().min(u32::MAX as usize) as u32)
    }

    #[tokio::test]
    async fn test_fetch_then_hit() {
        let cache = byte_cache(1024);
        let calls = AtomicU64::new(0);
        for _ in 0..3 {
            let value = cache
                .get_or_fetch("k".to_string(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(b"value".to_vec()))
                })
                .await
                .unwrap();
            assert_eq!(&**value, b"value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce() {
        let cache = Arc::new(byte_cache(1 << 20));
        let calls = Arc::new(AtomicU64::new(0));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_fetch("cold".to_string(), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(Arc::new(vec![7u8; 64]))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();
        let results = futures::future::join_all(tasks).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap().len(), 64);
        }
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache = byte_cache(1024);
        let err = cache
            .get_or_fetch("k".to_string(), || async {
                Err(Error::storage("backend down"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        // Next caller retries and succeeds.
        let value = cache
            .get_or_fetch("k".to_string(), || async { Ok(Arc::new(vec![1u8])) })
            .await
            .unwrap();
        assert_eq!(value.len(), 1);
    }
}
