//! Provider invocation seam.
//!
//! The orchestrator never talks to agents directly. Callers supply a
//! [`ProviderClient`] that knows how to reach a provider's `endpoint_ref`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::types::{CallChain, EntryId, HistoryMessage, TrustEntry, VoteRole};

/// An answer from another participant in the same vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAnswer {
    /// Answering provider.
    pub provider_id: EntryId,
    /// Free-form answer.
    pub content: String,
}

/// Everything a provider sees for one invocation.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Current user query.
    pub query: String,
    /// Conversation so far.
    pub history: Vec<HistoryMessage>,
    /// Alpha's preliminary answer. Set for the final round, and for betas
    /// with `prelim = true`.
    pub preliminary: Option<String>,
    /// Beta answers. Only set for the final round.
    pub peer_answers: Vec<PeerAnswer>,
    /// Alpha ancestry including the alpha of this vote.
    ///
    /// A provider that runs its own nested vote must pass this chain on,
    /// with its own id as `self_id`.
    pub chain: CallChain,
    /// Round this call belongs to.
    pub round: VoteRole,
    /// Turn deadline; nested votes should not outlive it.
    pub deadline: Instant,
}

/// A provider's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReply {
    /// Free-form answer text.
    pub content: String,
}

impl ProviderReply {
    /// Create a reply.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Error type for provider calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Endpoint could not be reached.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
    /// Call did not finish within its timeout.
    #[error("Provider call timed out")]
    Timeout,
    /// Provider refused or returned an unusable answer.
    #[error("Provider rejected request: {0}")]
    Rejected(String),
}

/// Reaches external answering agents.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Invoke `provider` with `request`.
    async fn invoke(
        &self,
        provider: &TrustEntry,
        request: ProviderRequest,
    ) -> Result<ProviderReply, ProviderError>;
}
