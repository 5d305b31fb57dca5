// Response Cache Service
//
// Memoizes expensive responses under a digest of (question, identity, mode).
// Entries expire by TTL; the oldest-created entry is evicted at capacity.

use crate::models::Identity;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::{Duration, Instant};

/// Hex characters kept from the sha256 digest
const KEY_DIGEST_LEN: usize = 32;

/// The parts a cached response is keyed on.
///
/// The question is compared case- and whitespace-insensitively; everything
/// else is compared exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    question: String,
    identity: Identity,
    mode: String,
    extra: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(question: &str, identity: &Identity, mode: &str) -> Self {
        Self {
            question: normalize_question(question),
            identity: identity.clone(),
            mode: mode.to_string(),
            extra: BTreeMap::new(),
        }
    }

    /// Add extra key context, such as the backend a statement ran against
    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    /// Fixed-length digest of the canonical key material
    pub fn digest(&self) -> String {
        let material = serde_json::json!({
            "question": self.question,
            "user_id": self.identity.key(),
            "mode": self.mode,
            "extra": self.extra,
        });
        let hash = Sha256::digest(material.to_string().as_bytes());
        let mut digest = hex::encode(hash);
        digest.truncate(KEY_DIGEST_LEN);
        digest
    }
}

fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
    hit_count: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    counters: Counters,
    last_cleanup: Instant,
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Fraction of lookups served from the cache (0.0 to 1.0)
    pub hit_rate: f64,
    /// Entries removed by capacity eviction, expiry or invalidation
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    pub total_entries: usize,
    pub max_entries: usize,
    pub default_ttl_secs: u64,
}

/// TTL-expiring, capacity-bounded cache of computed responses.
///
/// Values are cloned out on a hit, so `V` is typically a small struct or an `Arc`.
pub struct ResponseCache<V> {
    state: Mutex<CacheState<V>>,
    max_entries: usize,
    default_ttl: Duration,
    cleanup_interval: Duration,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(max_entries: usize, default_ttl: Duration, cleanup_interval: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                counters: Counters::default(),
                last_cleanup: Instant::now(),
            }),
            max_entries: max_entries.max(1),
            default_ttl,
            cleanup_interval,
        }
    }

    /// Look up a non-expired value. Expired entries are removed on sight.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let digest = key.digest();
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.maybe_cleanup(state, now);

        let expired = match state.entries.get_mut(&digest) {
            None => {
                state.counters.misses += 1;
                tracing::debug!("Cache miss for key: {}", digest);
                return None;
            }
            Some(entry) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                let value = entry.value.clone();
                tracing::debug!("Cache hit for key: {} (hit_count: {})", digest, entry.hit_count);
                state.counters.hits += 1;
                return Some(value);
            }
            Some(_) => true,
        };

        if expired {
            state.entries.remove(&digest);
            state.counters.misses += 1;
            state.counters.evictions += 1;
            state.counters.expirations += 1;
            tracing::debug!("Cache expired for key: {}", digest);
        }
        None
    }

    /// Store a value, using the default TTL when `ttl` is `None`
    pub fn set(&self, key: &CacheKey, value: V, ttl: Option<Duration>) -> String {
        let digest = key.digest();
        let now = Instant::now();
        let mut state = self.state.lock();
        self.maybe_cleanup(&mut state, now);

        if state.entries.len() >= self.max_entries && !state.entries.contains_key(&digest) {
            Self::evict_oldest(&mut state);
        }

        state.entries.insert(
            digest.clone(),
            CacheEntry {
                value,
                created_at: now,
                ttl: ttl.unwrap_or(self.default_ttl),
                hit_count: 0,
            },
        );
        tracing::debug!("Cached response for key: {} (cache size: {})", digest, state.entries.len());
        digest
    }

    /// Remove one key, or everything when `key` is `None`.
    /// Returns the number of entries removed.
    pub fn invalidate(&self, key: Option<&CacheKey>) -> usize {
        let mut state = self.state.lock();
        let removed = match key {
            Some(key) => usize::from(state.entries.remove(&key.digest()).is_some()),
            None => {
                let count = state.entries.len();
                state.entries.clear();
                tracing::info!("Cleared {} cache entries", count);
                count
            }
        };
        state.counters.evictions += removed as u64;
        removed
    }

    /// Sweep expired entries now, ignoring the cleanup throttle
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        Self::sweep(&mut state, now)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let Counters {
            hits,
            misses,
            evictions,
            expirations,
        } = state.counters;
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            evictions,
            expirations,
            total_entries: state.entries.len(),
            max_entries: self.max_entries,
            default_ttl_secs: self.default_ttl.as_secs(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serve a cached value, or compute it with `compute` and cache it.
    ///
    /// Only successful results are stored. The lock is not held while
    /// `compute` runs, so concurrent misses on one key may both compute;
    /// the last write wins. Returns the value and whether it was a hit.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<(V, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok((value, true));
        }

        let value = compute().await?;
        self.set(key, value.clone(), ttl);
        Ok((value, false))
    }

    fn maybe_cleanup(&self, state: &mut CacheState<V>, now: Instant) {
        if now.duration_since(state.last_cleanup) < self.cleanup_interval {
            return;
        }
        Self::sweep(state, now);
    }

    fn sweep(state: &mut CacheState<V>, now: Instant) -> usize {
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - state.entries.len();

        state.counters.evictions += removed as u64;
        state.counters.expirations += removed as u64;
        state.last_cleanup = now;

        if removed > 0 {
            tracing::info!("Cleaned up {} expired cache entries", removed);
        }
        removed
    }

    fn evict_oldest(state: &mut CacheState<V>) {
        let oldest = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.created_at)
            .map(|(digest, _)| digest.clone());

        if let Some(digest) = oldest {
            state.entries.remove(&digest);
            state.counters.evictions += 1;
            tracing::debug!("Evicted cache entry: {}", digest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(max_entries: usize) -> ResponseCache<String> {
        ResponseCache::new(max_entries, Duration::from_secs(300), Duration::from_secs(60))
    }

    fn key(question: &str) -> CacheKey {
        CacheKey::new(question, &Identity::Anonymous, "sql")
    }

    #[test]
    fn test_key_normalizes_question() {
        let a = CacheKey::new("What are  total SALES? ", &Identity::user("7"), "sql");
        let b = CacheKey::new("what are total sales?", &Identity::user("7"), "sql");
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 32);
    }

    #[test]
    fn test_key_partitions_by_identity_mode_and_extra() {
        let base = CacheKey::new("total sales", &Identity::user("7"), "sql");
        let other_user = CacheKey::new("total sales", &Identity::user("8"), "sql");
        let anonymous = CacheKey::new("total sales", &Identity::Anonymous, "sql");
        let other_mode = CacheKey::new("total sales", &Identity::user("7"), "agent");
        let with_extra = base.clone().with_extra("backend", "sqlite");

        let digests: std::collections::HashSet<_> = [&base, &other_user, &anonymous, &other_mode, &with_extra]
            .iter()
            .map(|k| k.digest())
            .collect();
        assert_eq!(digests.len(), 5);
    }

    #[test]
    fn test_anonymous_does_not_share_entries_with_any_user_id() {
        let cache = cache(10);
        let anonymous = CacheKey::new("total sales", &Identity::Anonymous, "sql");
        let minus_one = CacheKey::new("total sales", &Identity::user("-1"), "sql");
        assert_ne!(anonymous.digest(), minus_one.digest());

        cache.set(&anonymous, "anonymous answer".to_string(), None);
        assert_eq!(cache.get(&minus_one), None);
        assert_eq!(cache.get(&anonymous), Some("anonymous answer".to_string()));
    }

    #[test]
    fn test_set_then_get() {
        let cache = cache(10);
        cache.set(&key("q1"), "v1".to_string(), None);

        assert_eq!(cache.get(&key("q1")), Some("v1".to_string()));
        assert_eq!(cache.get(&key("Q1")), Some("v1".to_string()));
        assert_eq!(cache.get(&key("q2")), None);
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let cache = cache(10);
        cache.set(&key("q1"), "v1".to_string(), Some(Duration::from_secs(1)));

        assert_eq!(cache.get(&key("q1")), Some("v1".to_string()));

        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(cache.get(&key("q1")), None);

        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.total_entries, 0);
    }

    #[test]
    fn test_capacity_evicts_oldest_created() {
        let cache = cache(3);
        for q in ["q1", "q2", "q3"] {
            cache.set(&key(q), q.to_string(), None);
            std::thread::sleep(Duration::from_millis(5));
        }

        // Reading q1 does not protect it: eviction is by creation time
        assert!(cache.get(&key("q1")).is_some());
        cache.set(&key("q4"), "q4".to_string(), None);

        assert_eq!(cache.len(), 3);
        assert!(cache.get(&key("q1")).is_none());
        assert!(cache.get(&key("q2")).is_some());
        assert!(cache.get(&key("q4")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = cache(2);
        cache.set(&key("q1"), "a".to_string(), None);
        cache.set(&key("q2"), "b".to_string(), None);
        cache.set(&key("q1"), "c".to_string(), None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("q1")), Some("c".to_string()));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_stats_hit_rate() {
        let cache = cache(10);
        cache.set(&key("q1"), "v1".to_string(), None);

        cache.get(&key("q1"));
        cache.get(&key("q1"));
        cache.get(&key("missing"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.max_entries, 10);
        assert_eq!(stats.default_ttl_secs, 300);
    }

    #[test]
    fn test_invalidate_one_and_all() {
        let cache = cache(10);
        cache.set(&key("q1"), "v1".to_string(), None);
        cache.set(&key("q2"), "v2".to_string(), None);
        cache.set(&key("q3"), "v3".to_string(), None);

        assert_eq!(cache.invalidate(Some(&key("q1"))), 1);
        assert_eq!(cache.invalidate(Some(&key("q1"))), 0);
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.invalidate(None), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 3);
    }

    #[test]
    fn test_cleanup_expired_sweeps_everything_stale() {
        let cache = cache(10);
        cache.set(&key("short"), "a".to_string(), Some(Duration::from_millis(10)));
        cache.set(&key("long"), "b".to_string(), Some(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_set_runs_throttled_sweep() {
        let cache: ResponseCache<String> =
            ResponseCache::new(10, Duration::from_secs(300), Duration::from_millis(20));
        cache.set(&key("stale"), "a".to_string(), Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(40));

        cache.set(&key("fresh"), "b".to_string(), None);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_get_or_try_insert_with_caches_success_only() {
        let cache = cache(10);
        let calls = AtomicUsize::new(0);

        let failed: Result<(String, bool), String> = cache
            .get_or_try_insert_with(&key("q1"), None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("backend down".to_string())
            })
            .await;
        assert!(failed.is_err());
        assert!(cache.is_empty());

        for expected_hit in [false, true] {
            let (value, hit) = cache
                .get_or_try_insert_with(&key("q1"), None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>("answer".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "answer");
            assert_eq!(hit, expected_hit);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
