//! Per-turn pipeline.
//!
//! ```text
//! table ──partition──> evaluate operators
//!                           │
//!              ┌────────────┴────────────┐
//!      resolve authorities          run vote
//!              └────────────┬────────────┘
//!                        assemble ──> EvidenceBundle
//! ```
//!
//! Authority resolution and voting run concurrently against the evaluated
//! table and share the turn deadline. Neither can fail the turn.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::authority::{AuthorityCache, AuthorityResolver, CacheStats, FeedFetcher, FeedRouter};
use crate::bundle::{BundleAssembler, BundleEntry, EntryOrigin, EvidenceBundle};
use crate::config::{EngineConfig, SelectionPolicy};
use crate::evaluator::{EvaluationReport, OperatorEvaluator};
use crate::observe::{EngineObserver, NoOpObserver};
use crate::types::{HistoryMessage, TrustEntry, TruthTable};
use crate::voting::{ProviderClient, VoteContext, VoteOutcome, VotingOrchestrator};

/// Error type for a turn.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Nothing to answer.
    #[error("Query is empty")]
    EmptyQuery,
}

/// Input for one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Complete table for this turn.
    pub table: TruthTable,
    /// Current query.
    pub query: String,
    /// Conversation so far.
    pub history: Vec<HistoryMessage>,
    /// Opaque context forwarded to the bundle.
    pub static_context: Vec<String>,
    /// Overrides the configured turn deadline.
    pub deadline: Option<Duration>,
}

impl TurnRequest {
    /// Create a request with no history or context.
    pub fn new(table: TruthTable, query: impl Into<String>) -> Self {
        Self {
            table,
            query: query.into(),
            history: Vec::new(),
            static_context: Vec::new(),
            deadline: None,
        }
    }

    /// Set conversation history.
    pub fn with_history(mut self, history: Vec<HistoryMessage>) -> Self {
        self.history = history;
        self
    }

    /// Set static context.
    pub fn with_static_context(mut self, context: Vec<String>) -> Self {
        self.static_context = context;
        self
    }

    /// Set the turn deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Output of one turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    /// Id used in this turn's tracing span.
    pub request_id: Uuid,
    /// Input table with evaluated operator certainties.
    #[serde(skip)]
    pub table: TruthTable,
    /// Fixed-point diagnostics.
    pub evaluation: EvaluationReport,
    /// Vote diagnostics.
    pub vote: VoteOutcome,
    /// Bundle for synthesis.
    pub bundle: EvidenceBundle,
    /// Engine's selection policy at the time of the turn.
    pub selection: SelectionPolicy,
}

impl TurnOutcome {
    /// Entries imported through authorities this turn.
    pub fn imported(&self) -> Vec<&TrustEntry> {
        self.bundle.from_origin(EntryOrigin::Authority).collect()
    }

    /// Entries materialized from provider answers this turn.
    pub fn provider_entries(&self) -> Vec<&TrustEntry> {
        self.bundle.from_origin(EntryOrigin::Provider).collect()
    }

    /// Bundle subset under the engine's selection policy.
    pub fn selected(&self) -> Vec<&BundleEntry> {
        self.bundle.select(&self.selection)
    }
}

/// Builder for [`TrustEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    fetcher: Option<Arc<dyn FeedFetcher>>,
    providers: Option<Arc<dyn ProviderClient>>,
    observer: Option<Arc<dyn EngineObserver>>,
    cache: Option<Arc<AuthorityCache>>,
}

impl EngineBuilder {
    /// Use a custom feed fetcher.
    pub fn fetcher(mut self, fetcher: Arc<dyn FeedFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Enable voting through `client`.
    pub fn providers(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.providers = Some(client);
        self
    }

    /// Report engine events to `observer`.
    pub fn observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Share an existing authority cache.
    pub fn cache(mut self, cache: Arc<AuthorityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Build the engine.
    pub fn build(self) -> TrustEngine {
        let config = self.config;
        let observer = self.observer.unwrap_or_else(|| Arc::new(NoOpObserver));
        let fetcher = self.fetcher.unwrap_or_else(|| {
            let router = match &config.fetch.allowed_file_root {
                Some(root) => FeedRouter::new().with_local_root(root.clone()),
                None => FeedRouter::new(),
            };
            Arc::new(router)
        });
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(AuthorityCache::new(config.fetch.cache_capacity)));

        let resolver = AuthorityResolver::new(fetcher, cache, config.fetch.clone(), Arc::clone(&observer));
        let voting = self
            .providers
            .map(|client| VotingOrchestrator::new(client, config.voting.clone(), Arc::clone(&observer)));

        TrustEngine {
            evaluator: OperatorEvaluator::new(config.evaluation.clone()),
            assembler: BundleAssembler::new(config.params_hash()),
            resolver,
            voting,
            observer,
            config,
        }
    }
}

/// The trust engine. Cheap to share; holds no per-turn state.
pub struct TrustEngine {
    config: EngineConfig,
    evaluator: OperatorEvaluator,
    resolver: AuthorityResolver,
    voting: Option<VotingOrchestrator>,
    assembler: BundleAssembler,
    observer: Arc<dyn EngineObserver>,
}

impl std::fmt::Debug for TrustEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustEngine")
            .field("config", &self.config)
            .field("voting", &self.voting.is_some())
            .finish_non_exhaustive()
    }
}

impl TrustEngine {
    /// Start building an engine.
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            fetcher: None,
            providers: None,
            observer: None,
            cache: None,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Authority cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.resolver.cache().stats()
    }

    /// Run one turn.
    pub async fn run(&self, request: TurnRequest) -> Result<TurnOutcome, EngineError> {
        if request.query.trim().is_empty() {
            return Err(EngineError::EmptyQuery);
        }
        let request_id = Uuid::new_v4();
        let span = info_span!("turn", request_id = %request_id);
        Ok(self.run_turn(request_id, request).instrument(span).await)
    }

    async fn run_turn(&self, request_id: Uuid, request: TurnRequest) -> TurnOutcome {
        let TurnRequest {
            mut table,
            query,
            history,
            static_context,
            deadline,
        } = request;
        let deadline = Instant::now() + deadline.unwrap_or_else(|| self.config.turn_deadline());

        let evaluation = self.evaluator.apply(&mut table, self.observer.as_ref());

        let table = Arc::new(table);
        let authorities: Vec<TrustEntry> = table.partition().authorities().cloned().collect();

        let resolve = self.resolver.resolve_all(authorities, Arc::clone(&table), deadline);
        let vote = async {
            match &self.voting {
                Some(voting) => {
                    voting
                        .vote(&table, &query, &history, VoteContext::root(deadline))
                        .await
                }
                None => {
                    if table.partition().providers().next().is_some() {
                        debug!("no provider client configured, providers stay silent");
                    }
                    VoteOutcome::default()
                }
            }
        };
        let (imported, vote) = tokio::join!(resolve, vote);

        let bundle = self.assembler.assemble(
            &table,
            imported,
            vote.materialize(),
            history,
            static_context,
        );
        info!(
            entries = bundle.len(),
            converged = evaluation.converged,
            answered = !vote.is_silent(),
            "turn complete"
        );

        let table = Arc::try_unwrap(table).unwrap_or_else(|shared| (*shared).clone());
        TurnOutcome {
            request_id,
            table,
            evaluation,
            vote,
            bundle,
            selection: self.config.selection.clone(),
        }
    }
}
