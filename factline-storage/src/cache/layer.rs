//! Fail-open cache layer over a [`KvBackend`].
//!
//! Caching is an optimization, never a correctness requirement: every
//! backend failure is logged, counted, and absorbed. Reads degrade to a miss
//! and writes report `false`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::key::CacheKey;
use super::stats::{CacheCounters, CacheStats};
use crate::traits::KvBackend;

/// Namespaced, TTL-aware cache with tag invalidation.
pub struct CacheLayer {
    backend: Arc<dyn KvBackend>,
    counters: CacheCounters,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            counters: CacheCounters::default(),
        }
    }

    /// Get a reference to the backing store.
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Read and decode a value. Any failure is reported as absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = match self.backend.get(key.as_str()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.counters.miss();
                return None;
            }
            Err(error) => {
                self.counters.error();
                self.counters.miss();
                warn!(cache_key = %key, %error, "cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                self.counters.hit();
                Some(value)
            }
            Err(error) => {
                self.counters.miss();
                warn!(cache_key = %key, %error, "cached value failed to decode, treating as miss");
                None
            }
        }
    }

    /// Encode and store a value. Returns whether the write landed.
    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) -> bool {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(cache_key = %key, %error, "value failed to encode, not cached");
                return false;
            }
        };

        match self.backend.set(key.as_str(), encoded, ttl).await {
            Ok(()) => {
                self.counters.write();
                true
            }
            Err(error) => {
                self.counters.error();
                warn!(cache_key = %key, %error, "cache write failed");
                false
            }
        }
    }

    /// Remove a key. Returns whether a live entry was removed.
    pub async fn delete(&self, key: &CacheKey) -> bool {
        match self.backend.delete(key.as_str()).await {
            Ok(removed) => {
                if removed {
                    self.counters.invalidated(1);
                }
                removed
            }
            Err(error) => {
                self.counters.error();
                warn!(cache_key = %key, %error, "cache delete failed");
                false
            }
        }
    }

    /// Return the cached value, or run `populate` once and cache its result.
    ///
    /// Concurrent callers that miss together each run `populate`; the last
    /// write wins. A `populate` error is returned as-is and nothing is
    /// cached.
    pub async fn get_or_populate<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        populate: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = populate().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    /// Store a value and register its key under each tag.
    ///
    /// Returns true only if the value and every tag registration landed.
    pub async fn set_with_tags<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        tags: &[CacheKey],
        ttl: Duration,
    ) -> bool {
        if !self.set(key, value, ttl).await {
            return false;
        }

        let mut all_registered = true;
        for tag in tags {
            if let Err(error) = self.backend.set_add(tag.as_str(), key.as_str(), ttl).await {
                self.counters.error();
                all_registered = false;
                warn!(cache_key = %key, tag = %tag, %error, "tag registration failed");
            }
        }
        all_registered
    }

    /// Delete every key registered under `tag`, then the tag set itself.
    ///
    /// Best-effort and not atomic across members. Returns the number of
    /// member keys actually removed.
    pub async fn invalidate_by_tag(&self, tag: &CacheKey) -> usize {
        let members = match self.backend.set_members(tag.as_str()).await {
            Ok(members) => members,
            Err(error) => {
                self.counters.error();
                warn!(tag = %tag, %error, "tag lookup failed, nothing invalidated");
                return 0;
            }
        };

        let mut removed = 0usize;
        for member in &members {
            match self.backend.delete(member).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(error) => {
                    self.counters.error();
                    warn!(tag = %tag, cache_key = %member, %error, "tag member delete failed");
                }
            }
        }

        if let Err(error) = self.backend.delete(tag.as_str()).await {
            self.counters.error();
            warn!(tag = %tag, %error, "tag set delete failed");
        }

        self.counters.invalidated(removed as u64);
        debug!(tag = %tag, members = members.len(), removed, "tag invalidated");
        removed
    }

    /// Snapshot of hit/miss/error counters.
    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKvBackend;
    use factline_core::{Clock, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn layer_with_clock() -> (CacheLayer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_717_200_000));
        let backend = Arc::new(MemoryKvBackend::new(clock.clone() as Arc<dyn Clock>));
        (CacheLayer::new(backend), clock)
    }

    fn key(segment: &str) -> CacheKey {
        CacheKey::new("facts", &[segment]).unwrap()
    }

    #[tokio::test]
    async fn test_get_after_set_within_ttl() {
        let (cache, clock) = layer_with_clock();
        assert!(cache.set(&key("a"), &"value".to_string(), Duration::from_secs(60)).await);

        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get::<String>(&key("a")).await.as_deref(), Some("value"));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get::<String>(&key("a")).await, None);
    }

    #[tokio::test]
    async fn test_undecodable_value_is_absent() {
        let (cache, _clock) = layer_with_clock();
        cache.set(&key("n"), &"not a number", Duration::from_secs(60)).await;
        assert_eq!(cache.get::<u32>(&key("n")).await, None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_get_or_populate_runs_once_then_hits() {
        let (cache, _clock) = layer_with_clock();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Result<u32, String> = cache
                .get_or_populate(&key("p"), Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await;
            assert_eq!(value, Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_populate_error_is_not_cached() {
        let (cache, _clock) = layer_with_clock();
        let result: Result<u32, String> = cache
            .get_or_populate(&key("e"), Duration::from_secs(60), || async {
                Err("boom".to_string())
            })
            .await;
        assert_eq!(result, Err("boom".to_string()));
        assert_eq!(cache.get::<u32>(&key("e")).await, None);
    }

    #[tokio::test]
    async fn test_invalidate_by_tag_removes_members() {
        let (cache, _clock) = layer_with_clock();
        let tag = CacheKey::tag("facts", &["t"]).unwrap();
        let ttl = Duration::from_secs(300);

        assert!(cache.set_with_tags(&key("k1"), &1u32, &[tag.clone()], ttl).await);
        assert!(cache.set_with_tags(&key("k2"), &2u32, &[tag.clone()], ttl).await);

        assert_eq!(cache.invalidate_by_tag(&tag).await, 2);
        assert_eq!(cache.get::<u32>(&key("k1")).await, None);
        assert_eq!(cache.get::<u32>(&key("k2")).await, None);
        assert_eq!(cache.invalidate_by_tag(&tag).await, 0);
    }

    #[tokio::test]
    async fn test_tag_set_outlives_shorter_member() {
        let (cache, clock) = layer_with_clock();
        let tag = CacheKey::tag("facts", &["t"]).unwrap();

        cache
            .set_with_tags(&key("long"), &1u32, &[tag.clone()], Duration::from_secs(3600))
            .await;
        cache
            .set_with_tags(&key("short"), &2u32, &[tag.clone()], Duration::from_secs(60))
            .await;

        clock.advance(Duration::from_secs(120));
        assert_eq!(cache.invalidate_by_tag(&tag).await, 1);
        assert_eq!(cache.get::<u32>(&key("long")).await, None);
    }

    #[tokio::test]
    async fn test_delete_reports_removal() {
        let (cache, _clock) = layer_with_clock();
        cache.set(&key("d"), &1u32, Duration::from_secs(60)).await;
        assert!(cache.delete(&key("d")).await);
        assert!(!cache.delete(&key("d")).await);
    }
}
