//! # trust-kernel
//!
//! Federated trust and certainty evaluation for evidence tables.
//!
//! The kernel answers one question per turn:
//!
//! > Given this table of evidence, **how much should each entry be believed**,
//! > and what do delegated authorities and answering agents add to it?
//!
//! ## Core Contract
//!
//! 1. Evaluate logical operators (And/Or/Not/Non) over certainties in `[-1, +1]`
//!    to a fixed point
//! 2. Import one hop of delegated evidence from authorities, namespaced and scaled
//! 3. Run a cycle-safe two-round vote among provider agents
//! 4. Hand everything back as an ordered, fingerprinted evidence bundle
//!
//! ## Architecture
//!
//! ```text
//! TruthTable → partition → OperatorEvaluator ─┬─ AuthorityResolver ─┬→ BundleAssembler → EvidenceBundle
//!                                             └─ VotingOrchestrator ┘
//!                                  AuthorityCache (shared across turns)
//! ```
//!
//! ## Guarantees
//!
//! - Certainties are always clamped to `[-1, +1]`
//! - Evaluation is deterministic: same table and limits give the same values
//! - Authority and provider failures never fail a turn; they contribute nothing
//! - No provider already in the call chain is ever invited again
//! - The kernel persists nothing; the caller owns every table

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod authority;
pub mod bundle;
pub mod canonical;
pub mod config;
pub mod engine;
pub mod evaluator;
pub mod observe;
pub mod types;
pub mod voting;

// Re-exports
pub use types::{
    clamp_certainty, CallChain, EntryId, EntryKind, HistoryMessage, OperatorKind, Partition,
    Provenance, Role, TableError, TrustEntry, TruthTable, VoteRole,
};
pub use config::{EngineConfig, EvaluationLimits, FetchLimits, SelectionPolicy, VotingLimits};
pub use canonical::{canonical_hash, canonical_hash_hex, sha256_hex, to_canonical_bytes};
pub use evaluator::{EvaluationReport, InvalidOperator, OperatorError, OperatorEvaluator};
pub use authority::{
    AuthorityCache, AuthorityResolver, CacheStats, FeedFetcher, FeedRouter, FeedSource,
    FetchError, HttpsFetcher, LocalFileFetcher, ResolveError,
};
pub use voting::{
    classify_statements, rank_providers, Answer, PeerAnswer, ProviderClient, ProviderError,
    ProviderReply, ProviderRequest, Statement, StatementKind, VoteContext, VoteOutcome,
    VotingOrchestrator,
};
pub use bundle::{BundleAssembler, BundleEntry, EntryOrigin, EvidenceBundle};
pub use engine::{EngineBuilder, EngineError, TrustEngine, TurnOutcome, TurnRequest};
pub use observe::{
    EngineEvent, EngineObserver, NoOpObserver, RecordingObserver, Severity,
};
