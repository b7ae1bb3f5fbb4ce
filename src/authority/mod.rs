//! One-hop federated import of delegated trust tables.
//!
//! An authority entry points at a remote feed. Resolution fetches the feed
//! (through the shared cache), keeps evaluable records, and re-materializes
//! them locally under the authority's namespace with scaled certainty:
//!
//! ```text
//! local id        = "{authority_id}:{remote_id}"
//! local certainty = clamp(authority.certainty * remote.certainty)
//! ```
//!
//! Resolution never fails a turn. Any error is logged, reported to the
//! observer, and the authority contributes nothing.

mod cache;
mod feed;
mod fetch;

pub use cache::{AuthorityCache, CacheStats, FeedSnapshot};
pub use feed::{parse_feed, FeedError, FeedParse, SkipCounts};
pub use fetch::{FeedFetcher, FeedRouter, FeedSource, FetchError, HttpsFetcher, LocalFileFetcher};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::canonical::sha256_hex;
use crate::config::FetchLimits;
use crate::observe::{emit, EngineEvent, EngineObserver};
use crate::types::{clamp_certainty, EntryId, EntryKind, Provenance, TrustEntry, TruthTable};

/// Error type for authority resolution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    /// Entry is not an authority.
    #[error("Entry {0} is not an authority")]
    NotAnAuthority(EntryId),
    /// Fetch was rejected or failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Fetch exceeded the per-fetch timeout.
    #[error("Feed fetch timed out")]
    Timeout,
    /// Feed body could not be parsed.
    #[error(transparent)]
    Parse(#[from] FeedError),
}

/// Resolves authority entries into namespaced, scaled local entries.
#[derive(Clone)]
pub struct AuthorityResolver {
    fetcher: Arc<dyn FeedFetcher>,
    cache: Arc<AuthorityCache>,
    limits: FetchLimits,
    observer: Arc<dyn EngineObserver>,
}

impl std::fmt::Debug for AuthorityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityResolver")
            .field("cache", &self.cache)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl AuthorityResolver {
    /// Create a resolver.
    pub fn new(
        fetcher: Arc<dyn FeedFetcher>,
        cache: Arc<AuthorityCache>,
        limits: FetchLimits,
        observer: Arc<dyn EngineObserver>,
    ) -> Self {
        Self {
            fetcher,
            cache,
            limits,
            observer,
        }
    }

    /// Shared feed cache.
    pub fn cache(&self) -> &Arc<AuthorityCache> {
        &self.cache
    }

    /// Resolve one authority. Failures yield an empty list.
    #[instrument(skip_all, fields(authority = %authority.id))]
    pub async fn resolve(&self, authority: &TrustEntry, local: &TruthTable) -> Vec<TrustEntry> {
        match self.try_resolve(authority, local).await {
            Ok(entries) => {
                debug!(imported = entries.len(), "authority resolved");
                entries
            }
            Err(e) => {
                let url = match &authority.kind {
                    EntryKind::Authority { url, .. } => url.clone(),
                    _ => String::new(),
                };
                emit(
                    self.observer.as_ref(),
                    EngineEvent::AuthorityDegraded {
                        authority_id: authority.id.clone(),
                        url,
                        reason: e.to_string(),
                    },
                );
                Vec::new()
            }
        }
    }

    /// Resolve one authority, surfacing the failure.
    pub async fn try_resolve(
        &self,
        authority: &TrustEntry,
        local: &TruthTable,
    ) -> Result<Vec<TrustEntry>, ResolveError> {
        let EntryKind::Authority { url, refresh, .. } = &authority.kind else {
            return Err(ResolveError::NotAnAuthority(authority.id.clone()));
        };
        let source = FeedSource::parse(url, self.limits.allowed_file_root.as_deref())?;

        let snapshot = self
            .cache
            .get_or_fetch(url, Duration::from_secs(*refresh), || self.fetch_snapshot(&source))
            .await?;

        Ok(import_records(authority, url, &snapshot, local))
    }

    async fn fetch_snapshot(&self, source: &FeedSource) -> Result<FeedSnapshot, ResolveError> {
        let bytes = tokio::time::timeout(
            self.limits.fetch_timeout(),
            self.fetcher.fetch(source, self.limits.max_feed_bytes),
        )
        .await
        .map_err(|_| ResolveError::Timeout)??;

        let digest = sha256_hex(&bytes);
        let parse = parse_feed(&bytes, self.limits.max_feed_entries)?;
        if parse.skipped.total() > 0 {
            debug!(skipped = ?parse.skipped, "feed lines skipped");
        }
        Ok(FeedSnapshot {
            records: Arc::new(parse.records),
            digest,
            truncated: parse.truncated,
        })
    }

    /// Resolve every authority as an independent task.
    ///
    /// At most `max_concurrent_fetches` run at once. Tasks still running at
    /// `deadline` are abandoned. Output is grouped by authority id, each
    /// group in feed order.
    pub async fn resolve_all(
        &self,
        authorities: Vec<TrustEntry>,
        local: Arc<TruthTable>,
        deadline: Instant,
    ) -> Vec<TrustEntry> {
        if authorities.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.limits.max_concurrent_fetches.max(1)));
        let mut tasks = JoinSet::new();
        for authority in authorities {
            let resolver = self.clone();
            let local = Arc::clone(&local);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let entries = resolver.resolve(&authority, &local).await;
                (authority.id, entries)
            });
        }

        let mut groups = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(group))) => groups.push(group),
                Ok(Some(Err(e))) => warn!(error = %e, "authority task failed"),
                Ok(None) => break,
                Err(_) => {
                    let abandoned = tasks.len();
                    tasks.abort_all();
                    emit(
                        self.observer.as_ref(),
                        EngineEvent::DeadlineExpired {
                            stage: "authority".to_string(),
                            abandoned,
                        },
                    );
                    break;
                }
            }
        }

        groups.sort_by(|a, b| a.0.cmp(&b.0));
        groups.into_iter().flat_map(|(_, entries)| entries).collect()
    }
}

/// Namespace, scale and stamp the records of one feed.
fn import_records(
    authority: &TrustEntry,
    url: &str,
    snapshot: &FeedSnapshot,
    local: &TruthTable,
) -> Vec<TrustEntry> {
    let mut imported = Vec::with_capacity(snapshot.records.len());
    for record in snapshot.records.iter() {
        let id = record.id.namespaced(&authority.id);
        if local.get(id.as_str()).is_some() {
            warn!(id = %id, "imported id collides with local entry, skipping");
            continue;
        }

        let mut entry = record.clone();
        entry.id = id;
        entry.certainty = clamp_certainty(authority.certainty * record.certainty);
        if let Some(children) = entry.kind.children_mut() {
            for child in children.iter_mut() {
                *child = child.namespaced(&authority.id);
            }
        }
        entry.provenance = Some(Provenance::Authority {
            authority_id: authority.id.clone(),
            url: url.to_string(),
            feed_digest: snapshot.digest.clone(),
        });
        imported.push(entry);
    }
    imported
}
