//! Authority feed cache with single-flight fetches.
//!
//! Completed feeds live in a bounded LRU keyed by URL. Misses go through a
//! per-URL `OnceCell` so that concurrent resolutions of the same URL share
//! one fetch. Failures are handed to every waiter of that flight but are not
//! cached; the next miss tries again.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use super::ResolveError;
use crate::types::TrustEntry;

const DEFAULT_CAPACITY: usize = 256;

/// Parsed contents of one fetched feed.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    /// Evaluable records, un-namespaced and unscaled.
    pub records: Arc<Vec<TrustEntry>>,
    /// SHA-256 of the raw feed bytes.
    pub digest: String,
    /// Whether the feed hit the entry cap.
    pub truncated: bool,
}

#[derive(Debug, Clone)]
struct CachedFeed {
    snapshot: FeedSnapshot,
    fetched_at: Instant,
}

type Flight = Arc<OnceCell<Result<FeedSnapshot, ResolveError>>>;

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Cached feeds.
    pub len: usize,
    /// Capacity.
    pub cap: usize,
    /// Fetches started since creation.
    pub fetches: u64,
    /// URLs with a flight in progress.
    pub inflight: usize,
}

/// Shared cache of authority feeds. The only state that outlives a turn.
pub struct AuthorityCache {
    entries: Mutex<LruCache<String, CachedFeed>>,
    inflight: DashMap<String, Flight>,
    fetches: AtomicU64,
}

impl std::fmt::Debug for AuthorityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityCache").field("stats", &self.stats()).finish()
    }
}

impl Default for AuthorityCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl AuthorityCache {
    /// Create a cache holding at most `capacity` feeds.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            inflight: DashMap::new(),
            fetches: AtomicU64::new(0),
        }
    }

    /// Cached snapshot for `url` if younger than `ttl`.
    pub fn get_fresh(&self, url: &str, ttl: Duration) -> Option<FeedSnapshot> {
        let mut entries = self.entries.lock();
        match entries.get(url) {
            Some(cached) if cached.fetched_at.elapsed() < ttl => Some(cached.snapshot.clone()),
            _ => None,
        }
    }

    /// Return the cached snapshot for `url`, or run `fetch` once for all
    /// concurrent callers that miss on the same URL.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        url: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<FeedSnapshot, ResolveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FeedSnapshot, ResolveError>>,
    {
        if let Some(hit) = self.get_fresh(url, ttl) {
            tracing::trace!(url, "authority cache hit");
            return Ok(hit);
        }

        let flight: Flight = {
            let mut slot = self.inflight.entry(url.to_string()).or_default();
            // A settled cell left behind by a cancelled waiter is stale.
            if slot.initialized() {
                *slot = Flight::default();
            }
            Arc::clone(slot.value())
        };

        let result = flight
            .get_or_init(move || async move {
                if let Some(hit) = self.get_fresh(url, ttl) {
                    return Ok(hit);
                }
                self.fetches.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(url, "authority cache miss, fetching");
                let fetched = fetch().await;
                if let Ok(snapshot) = &fetched {
                    self.entries.lock().put(
                        url.to_string(),
                        CachedFeed {
                            snapshot: snapshot.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                }
                fetched
            })
            .await
            .clone();

        self.inflight.remove_if(url, |_, current| Arc::ptr_eq(current, &flight));
        result
    }

    /// Drop a cached feed.
    pub fn invalidate(&self, url: &str) {
        self.entries.lock().pop(url);
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            len: entries.len(),
            cap: entries.cap().get(),
            fetches: self.fetches.load(Ordering::Relaxed),
            inflight: self.inflight.len(),
        }
    }
}
