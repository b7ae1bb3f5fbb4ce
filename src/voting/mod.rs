//! Cycle-safe two-round voting among provider agents.
//!
//! ## Protocol
//!
//! ```text
//!              query
//!                |
//!          alpha (prelim)  ----> R_alpha
//!           /    |    \
//!       beta_1 beta_2 beta_n     (concurrent; R_alpha only if prelim=true)
//!           \    |    /
//!          alpha (final)   ----> R_alpha_final
//! ```
//!
//! Providers are ranked by `(-|certainty|, -timestamp, id)`. The first
//! eligible provider is alpha; if its preliminary call fails, the next one
//! is tried once. The rest are betas.
//!
//! ## Cycle prevention
//!
//! Every vote carries a [`CallChain`] of the alphas above it. Any provider
//! already in the chain is excluded and stays silent, whether it would be
//! alpha or beta. A beta that runs its own nested vote becomes that vote's
//! alpha: it passes the chain it received plus its own id
//! (`VoteContext::nested`), and every eligible provider in its table is
//! invited as a beta. The nested vote only collects beta answers; the leader
//! folds them into its own final reply. Direct cycles, transitive cycles and
//! deep re-invitations are all blocked.

mod classify;
mod provider;
mod trust;

pub use classify::{classify, classify_statements, Statement, StatementKind};
pub use provider::{PeerAnswer, ProviderClient, ProviderError, ProviderReply, ProviderRequest};
pub use trust::{adjust_trust_score, ClaimOutcome, TrustEvidence};

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config::VotingLimits;
use crate::observe::{emit, EngineEvent, EngineObserver};
use crate::types::{
    CallChain, EntryId, EntryKind, HistoryMessage, Provenance, TrustEntry, TruthTable, VoteRole,
};

/// Alpha attempts before the vote gives up.
const MAX_ALPHA_ATTEMPTS: usize = 2;

/// Ranking wrapper for provider entries.
///
/// Orders by descending `|certainty|`, then newest timestamp, then id.
#[derive(Debug, Clone, Copy)]
struct RankedProvider<'a>(&'a TrustEntry);

impl PartialEq for RankedProvider<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankedProvider<'_> {}

impl PartialOrd for RankedProvider<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankedProvider<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .certainty
            .abs()
            .total_cmp(&self.0.certainty.abs())
            .then_with(|| other.0.timestamp.cmp(&self.0.timestamp))
            .then_with(|| self.0.id.cmp(&other.0.id))
    }
}

/// Provider entries in vote rank order.
pub fn rank_providers<'a>(entries: impl IntoIterator<Item = &'a TrustEntry>) -> Vec<&'a TrustEntry> {
    let mut ranked: Vec<RankedProvider<'a>> = entries
        .into_iter()
        .filter(|e| matches!(e.kind, EntryKind::Provider { .. }))
        .map(RankedProvider)
        .collect();
    ranked.sort();
    ranked.into_iter().map(|r| r.0).collect()
}

fn prelim_flag(provider: &TrustEntry) -> bool {
    match provider.kind {
        EntryKind::Provider { prelim, .. } => prelim,
        _ => false,
    }
}

fn endpoint_ref(provider: &TrustEntry) -> Option<String> {
    match &provider.kind {
        EntryKind::Provider { endpoint_ref, .. } => Some(endpoint_ref.clone()),
        _ => None,
    }
}

/// Where a vote sits in the call tree.
#[derive(Debug, Clone)]
pub struct VoteContext {
    /// Alphas above this vote.
    pub chain: CallChain,
    /// Provider leading this vote as alpha, for nested votes.
    pub self_id: Option<EntryId>,
    /// Leader's own preliminary answer, shown to betas with `prelim = true`.
    pub preliminary: Option<String>,
    /// Abandon outstanding calls at this instant.
    pub deadline: Instant,
}

impl VoteContext {
    /// Context for a top-level vote.
    pub fn root(deadline: Instant) -> Self {
        Self {
            chain: CallChain::root(),
            self_id: None,
            preliminary: None,
            deadline,
        }
    }

    /// Context for a nested vote led by `self_id` while answering `request`.
    pub fn nested(request: &ProviderRequest, self_id: impl Into<EntryId>) -> Self {
        Self {
            chain: request.chain.clone(),
            self_id: Some(self_id.into()),
            preliminary: None,
            deadline: request.deadline,
        }
    }

    /// Share the leader's draft answer with betas that accept one.
    pub fn with_preliminary(mut self, answer: impl Into<String>) -> Self {
        self.preliminary = Some(answer.into());
        self
    }
}

/// One provider answer within a vote.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    /// Answering provider.
    pub provider_id: EntryId,
    /// Round.
    pub role: VoteRole,
    /// Raw answer text.
    pub content: String,
    /// Per-statement classification of `content`.
    pub statements: Vec<Statement>,
    /// Provider's certainty at the time of the vote.
    pub certainty: f64,
    /// Provider's endpoint.
    pub endpoint_ref: Option<String>,
    /// Provider entry's timestamp, carried onto the materialized entry.
    pub timestamp: DateTime<Utc>,
    /// Chain the call was made under.
    pub chain: CallChain,
}

impl Answer {
    fn new(provider: &TrustEntry, role: VoteRole, reply: ProviderReply, chain: &CallChain) -> Self {
        Self {
            provider_id: provider.id.clone(),
            role,
            statements: classify_statements(&reply.content),
            content: reply.content,
            certainty: provider.certainty,
            endpoint_ref: endpoint_ref(provider),
            timestamp: provider.timestamp,
            chain: chain.clone(),
        }
    }

    /// Materialize as a provider-sourced reference entry.
    pub fn to_entry(&self) -> TrustEntry {
        let id = EntryId::new(format!("{}:{}", self.provider_id, self.role.suffix()));
        TrustEntry::reference(id, self.certainty, self.endpoint_ref.clone())
            .with_title(format!("{} ({})", self.provider_id, self.role))
            .with_content(self.content.clone())
            .with_timestamp(self.timestamp)
            .with_provenance(Provenance::Provider {
                provider_id: self.provider_id.clone(),
                role: self.role,
                chain: self.chain.ids(),
            })
    }
}

/// Result of one vote. Missing pieces mean silence, never failure.
///
/// A nested vote fills only `alpha` (its leader), `betas`, `excluded`,
/// `failed` and `chain`; the leader owns its preliminary and final answers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VoteOutcome {
    /// Alpha that answered, if any.
    pub alpha: Option<EntryId>,
    /// Alpha's preliminary answer.
    pub prelim: Option<Answer>,
    /// Beta answers in rank order.
    pub betas: Vec<Answer>,
    /// Alpha's final answer.
    pub final_answer: Option<Answer>,
    /// Providers silenced by the call chain.
    pub excluded: Vec<EntryId>,
    /// Providers whose call failed or timed out.
    pub failed: Vec<EntryId>,
    /// Chain including this vote's alpha.
    pub chain: CallChain,
}

impl VoteOutcome {
    /// Best available answer: final if present, otherwise preliminary.
    pub fn answer(&self) -> Option<&str> {
        self.final_answer
            .as_ref()
            .or(self.prelim.as_ref())
            .map(|a| a.content.as_str())
    }

    /// Whether no provider answered.
    pub fn is_silent(&self) -> bool {
        self.prelim.is_none() && self.betas.is_empty()
    }

    /// Beta answers as the alpha's final round sees them.
    pub fn peer_answers(&self) -> Vec<PeerAnswer> {
        self.betas
            .iter()
            .map(|a| PeerAnswer {
                provider_id: a.provider_id.clone(),
                content: a.content.clone(),
            })
            .collect()
    }

    /// Provider-sourced entries: prelim, betas, then final.
    pub fn materialize(&self) -> Vec<TrustEntry> {
        self.prelim
            .iter()
            .chain(self.betas.iter())
            .chain(self.final_answer.iter())
            .map(Answer::to_entry)
            .collect()
    }
}

async fn invoke_bounded(
    client: &dyn ProviderClient,
    provider: &TrustEntry,
    request: ProviderRequest,
    timeout: Duration,
) -> Result<ProviderReply, ProviderError> {
    let limit = request.deadline.min(Instant::now() + timeout);
    tokio::time::timeout_at(limit, client.invoke(provider, request))
        .await
        .map_err(|_| ProviderError::Timeout)?
}

/// Runs votes over the provider entries of a table.
#[derive(Clone)]
pub struct VotingOrchestrator {
    client: Arc<dyn ProviderClient>,
    limits: VotingLimits,
    observer: Arc<dyn EngineObserver>,
}

impl std::fmt::Debug for VotingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VotingOrchestrator")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl VotingOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        client: Arc<dyn ProviderClient>,
        limits: VotingLimits,
        observer: Arc<dyn EngineObserver>,
    ) -> Self {
        Self {
            client,
            limits,
            observer,
        }
    }

    /// Run one vote.
    ///
    /// With `ctx.self_id` set this is a nested vote: the leader is alpha and
    /// every eligible provider is a beta under `chain + self_id`.
    #[instrument(skip_all, fields(chain = %ctx.chain, self_id = ?ctx.self_id))]
    pub async fn vote(
        &self,
        table: &TruthTable,
        query: &str,
        history: &[HistoryMessage],
        ctx: VoteContext,
    ) -> VoteOutcome {
        let chain = match &ctx.self_id {
            Some(id) if !ctx.chain.contains(id) => ctx.chain.push(id.clone()),
            _ => ctx.chain.clone(),
        };
        let mut outcome = VoteOutcome {
            chain: chain.clone(),
            ..VoteOutcome::default()
        };

        let (eligible, cyclic): (Vec<&TrustEntry>, Vec<&TrustEntry>) = rank_providers(table.iter())
            .into_iter()
            .partition(|p| !chain.contains(&p.id));
        for provider in cyclic {
            self.exclude(provider, &chain, &mut outcome);
        }

        let request = |preliminary: Option<String>, peer_answers, chain: CallChain, round| ProviderRequest {
            query: query.to_string(),
            history: history.to_vec(),
            preliminary,
            peer_answers,
            chain,
            round,
            deadline: ctx.deadline,
        };

        if let Some(leader) = &ctx.self_id {
            outcome.alpha = Some(leader.clone());
            self.collect_betas(
                &eligible,
                ctx.preliminary.as_deref(),
                &chain,
                ctx.deadline,
                |shown| request(shown, Vec::new(), chain.clone(), VoteRole::Beta),
                &mut outcome,
            )
            .await;
            debug!(
                leader = %leader,
                betas = outcome.betas.len(),
                excluded = outcome.excluded.len(),
                failed = outcome.failed.len(),
                "nested vote complete"
            );
            return outcome;
        }

        // Round 1: alpha, with one fallback.
        let mut selected = None;
        let mut betas_from = 0;
        for (rank, candidate) in eligible.iter().enumerate().take(MAX_ALPHA_ATTEMPTS) {
            betas_from = rank + 1;
            let alpha_chain = chain.push(candidate.id.clone());
            let req = request(None, Vec::new(), alpha_chain.clone(), VoteRole::AlphaPrelim);
            match invoke_bounded(self.client.as_ref(), candidate, req, self.limits.provider_timeout()).await {
                Ok(reply) => {
                    selected = Some((*candidate, alpha_chain, reply));
                    break;
                }
                Err(e) => self.fail(candidate, VoteRole::AlphaPrelim, &e, &mut outcome),
            }
        }
        let Some((alpha, alpha_chain, reply)) = selected else {
            if !eligible.is_empty() {
                warn!("no alpha candidate answered, vote is silent");
            }
            return outcome;
        };

        let prelim = Answer::new(alpha, VoteRole::AlphaPrelim, reply, &alpha_chain);
        outcome.alpha = Some(alpha.id.clone());
        outcome.chain = alpha_chain.clone();

        // Round 2: betas, concurrently.
        self.collect_betas(
            &eligible[betas_from.min(eligible.len())..],
            Some(prelim.content.as_str()),
            &alpha_chain,
            ctx.deadline,
            |shown| request(shown, Vec::new(), alpha_chain.clone(), VoteRole::Beta),
            &mut outcome,
        )
        .await;

        // Round 3: alpha again, with everything.
        let req = request(
            Some(prelim.content.clone()),
            outcome.peer_answers(),
            alpha_chain.clone(),
            VoteRole::AlphaFinal,
        );
        match invoke_bounded(self.client.as_ref(), alpha, req, self.limits.provider_timeout()).await {
            Ok(reply) => {
                outcome.final_answer = Some(Answer::new(alpha, VoteRole::AlphaFinal, reply, &alpha_chain));
            }
            Err(e) => {
                let event = EngineEvent::ProviderFailed {
                    provider_id: alpha.id.clone(),
                    role: VoteRole::AlphaFinal,
                    reason: e.to_string(),
                };
                emit(self.observer.as_ref(), event);
            }
        }
        outcome.prelim = Some(prelim);

        debug!(
            alpha = %alpha.id,
            betas = outcome.betas.len(),
            excluded = outcome.excluded.len(),
            failed = outcome.failed.len(),
            "vote complete"
        );
        outcome
    }

    async fn collect_betas<F>(
        &self,
        betas: &[&TrustEntry],
        preliminary: Option<&str>,
        chain: &CallChain,
        deadline: Instant,
        make_request: F,
        outcome: &mut VoteOutcome,
    ) where
        F: Fn(Option<String>) -> ProviderRequest,
    {
        for (beta, result) in self.run_betas(betas, preliminary, chain, deadline, make_request).await {
            match result {
                Ok(reply) => outcome.betas.push(Answer::new(&beta, VoteRole::Beta, reply, chain)),
                Err(e) => self.fail(&beta, VoteRole::Beta, &e, outcome),
            }
        }
    }

    /// Invoke betas concurrently. Results come back in rank order, one per
    /// beta; betas still running at the deadline are aborted and reported
    /// as timed out.
    async fn run_betas<F>(
        &self,
        betas: &[&TrustEntry],
        preliminary: Option<&str>,
        chain: &CallChain,
        deadline: Instant,
        make_request: F,
    ) -> Vec<(TrustEntry, Result<ProviderReply, ProviderError>)>
    where
        F: Fn(Option<String>) -> ProviderRequest,
    {
        if betas.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.limits.max_concurrency.max(1)));
        let timeout = self.limits.provider_timeout();
        let mut tasks = JoinSet::new();

        for (rank, beta) in betas.iter().enumerate() {
            debug_assert!(!chain.contains(&beta.id));
            let shown = preliminary
                .filter(|_| prelim_flag(beta))
                .map(str::to_string);
            let request = make_request(shown);

            let client = Arc::clone(&self.client);
            let semaphore = Arc::clone(&semaphore);
            let beta = (*beta).clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = invoke_bounded(client.as_ref(), &beta, request, timeout).await;
                (rank, result)
            });
        }

        let mut results: Vec<Option<Result<ProviderReply, ProviderError>>> = vec![None; betas.len()];
        let mut expired = false;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((rank, result)))) => results[rank] = Some(result),
                Ok(Some(Err(e))) => warn!(error = %e, "beta task failed"),
                Ok(None) => break,
                Err(_) => {
                    expired = true;
                    let abandoned = tasks.len();
                    tasks.abort_all();
                    emit(
                        self.observer.as_ref(),
                        EngineEvent::DeadlineExpired {
                            stage: "voting".to_string(),
                            abandoned,
                        },
                    );
                    break;
                }
            }
        }

        betas
            .iter()
            .zip(results)
            .map(|(beta, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(if expired {
                        ProviderError::Timeout
                    } else {
                        ProviderError::Unavailable("beta task failed".to_string())
                    })
                });
                ((*beta).clone(), result)
            })
            .collect()
    }

    fn exclude(&self, provider: &TrustEntry, chain: &CallChain, outcome: &mut VoteOutcome) {
        outcome.excluded.push(provider.id.clone());
        emit(
            self.observer.as_ref(),
            EngineEvent::CycleExcluded {
                provider_id: provider.id.clone(),
                chain: chain.ids(),
            },
        );
    }

    fn fail(&self, provider: &TrustEntry, role: VoteRole, error: &ProviderError, outcome: &mut VoteOutcome) {
        outcome.failed.push(provider.id.clone());
        emit(
            self.observer.as_ref(),
            EngineEvent::ProviderFailed {
                provider_id: provider.id.clone(),
                role,
                reason: error.to_string(),
            },
        );
    }
}
