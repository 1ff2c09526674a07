// radarb - Weather and traffic dashboard backend for Lakewood, Ohio
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Time-bounded cache of upstream responses, one instance per proxied endpoint.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Key for a cached upstream response.
///
/// A key must be built from every request parameter that changes what the upstream
/// returns, otherwise responses for one request leak into another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parts: Vec<String> = parts.into_iter().map(|p| p.as_ref().to_owned()).collect();
        CacheKey(parts.join(","))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub etag: Option<String>,
    pub fetched_at: Instant,
}

/// Whether a value came from the cache or from the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Hit,
    Miss,
}

impl Lookup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lookup::Hit => "hit",
            Lookup::Miss => "miss",
        }
    }
}

/// Map of cached upstream payloads keyed by request signature.
///
/// Entries are only ever replaced by a successful fetch. A failed fetch leaves any
/// existing entry untouched, and entries are never served past their TTL by
/// [`TtlCache::get_or_fetch`]. Caches built with [`TtlCache::revalidating`] have no
/// TTL at all: entries are kept only so callers can revalidate them with an `ETag`.
#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Option<Duration>,
    entries: Mutex<HashMap<CacheKey, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            ttl: Some(ttl),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn revalidating() -> Self {
        TtlCache {
            ttl: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Value for `key` if it was fetched less than one TTL ago.
    pub fn get_fresh(&self, key: &CacheKey) -> Option<V> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| self.is_fresh(e))
            .map(|e| e.value.clone())
    }

    /// Entry for `key` regardless of its age.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: CacheKey, value: V) {
        self.insert_entry(key, value, None);
    }

    pub fn insert_with_etag(&self, key: CacheKey, value: V, etag: Option<String>) {
        self.insert_entry(key, value, etag);
    }

    /// Return the fresh cached value for `key` or call `fetch` and cache its result.
    ///
    /// Errors from `fetch` are returned as-is and never cached.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &CacheKey, fetch: F) -> Result<(V, Lookup), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(v) = self.get_fresh(key) {
            return Ok((v, Lookup::Hit));
        }

        let v = fetch().await?;
        self.insert(key.clone(), v.clone());
        Ok((v, Lookup::Miss))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_entry(&self, key: CacheKey, value: V, etag: Option<String>) {
        let mut entries = self.entries.lock();
        // Expired entries are never served again
        if self.ttl.is_some() {
            entries.retain(|_, e| self.is_fresh(e));
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                etag,
                fetched_at: Instant::now(),
            },
        );
    }

    fn is_fresh(&self, entry: &CacheEntry<V>) -> bool {
        match self.ttl {
            Some(ttl) => entry.fetched_at.elapsed() < ttl,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheKey, Lookup, TtlCache};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn test_cache_key_includes_all_parts() {
        let a = CacheKey::from_parts(["41.2", "-81.9", "41.5", "-81.7"]);
        let b = CacheKey::from_parts(["41.2", "-81.9", "41.5", "-81.6"]);

        assert_eq!("41.2,-81.9,41.5,-81.7", a.as_str());
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_fresh_within_ttl() {
        let cache = TtlCache::new(TTL);
        let key = CacheKey::from_parts(["a"]);
        cache.insert(key.clone(), "payload".to_owned());

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(Some("payload".to_owned()), cache.get_fresh(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_fresh_expired() {
        let cache = TtlCache::new(TTL);
        let key = CacheKey::from_parts(["a"]);
        cache.insert(key.clone(), "payload".to_owned());

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(None, cache.get_fresh(&key));
        // Still available for revalidation
        assert!(cache.get(&key).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_fetch_calls_upstream_once() {
        let cache = TtlCache::new(TTL);
        let key = CacheKey::from_parts(["41.2", "-81.9", "41.5", "-81.7"]);
        let calls = AtomicUsize::new(0);

        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(vec![1u8, 2, 3])
        };

        let (first, l1) = cache.get_or_fetch(&key, fetch).await.unwrap();
        let (second, l2) = cache
            .get_or_fetch(&key, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ()>(vec![9u8])
            })
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(Lookup::Miss, l1);
        assert_eq!(Lookup::Hit, l2);
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_fetch_refetches_after_ttl() {
        let cache = TtlCache::new(TTL);
        let key = CacheKey::from_parts(["a"]);

        cache.get_or_fetch(&key, || async { Ok::<_, ()>(1) }).await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        let (v, lookup) = cache.get_or_fetch(&key, || async { Ok::<_, ()>(2) }).await.unwrap();

        assert_eq!(2, v);
        assert_eq!(Lookup::Miss, lookup);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_fetch_error_keeps_entry() {
        let cache = TtlCache::new(TTL);
        let key = CacheKey::from_parts(["a"]);
        cache.insert(key.clone(), 1);
        tokio::time::advance(Duration::from_secs(400)).await;

        let res = cache.get_or_fetch(&key, || async { Err::<i32, _>("boom") }).await;

        assert_eq!(Err("boom"), res);
        assert_eq!(1, cache.get(&key).unwrap().value);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_independent() {
        let cache = TtlCache::new(TTL);
        let a = CacheKey::from_parts(["41.48", "-81.81"]);
        let b = CacheKey::from_parts(["41.49", "-81.81"]);
        cache.insert(a.clone(), "a");
        cache.insert(b.clone(), "b");

        assert_eq!(Some("a"), cache.get_fresh(&a));
        assert_eq!(Some("b"), cache.get_fresh(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_drops_expired_entries() {
        let cache = TtlCache::new(TTL);
        cache.insert(CacheKey::from_parts(["old"]), 1);
        tokio::time::advance(Duration::from_secs(301)).await;
        cache.insert(CacheKey::from_parts(["new"]), 2);

        assert_eq!(1, cache.len());
    }

    #[tokio::test]
    async fn test_revalidating_never_fresh() {
        let cache = TtlCache::revalidating();
        let key = CacheKey::from_parts(["41.48", "-81.81"]);
        cache.insert_with_etag(key.clone(), "<dwml/>".to_owned(), Some("\"abc\"".to_owned()));

        assert_eq!(None, cache.get_fresh(&key));
        let entry = cache.get(&key).unwrap();
        assert_eq!("<dwml/>", entry.value);
        assert_eq!(Some("\"abc\"".to_owned()), entry.etag);
    }
}
