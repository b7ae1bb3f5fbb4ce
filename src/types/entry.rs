//! Trust entry types.

use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::chain::VoteRole;

/// Default cache TTL for an authority, in seconds.
pub const DEFAULT_REFRESH_SECS: u64 = 3600;

/// Default trust score for a provider with no history.
pub const DEFAULT_TRUST_SCORE: f64 = 0.5;

/// Unique identifier for an entry within a truth table.
///
/// Wraps a string and implements `Ord` for deterministic ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Create a new EntryId.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix this id with a namespace: `"{namespace}:{self}"`.
    pub fn namespaced(&self, namespace: &EntryId) -> Self {
        Self(format!("{}:{}", namespace.0, self.0))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for EntryId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Clamp a certainty into `[-1, +1]`.
///
/// Non-finite input collapses to 0 (unknown).
pub fn clamp_certainty(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

fn de_certainty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    f64::deserialize(deserializer).map(clamp_certainty)
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn default_refresh() -> u64 {
    DEFAULT_REFRESH_SECS
}

fn default_trust_score() -> f64 {
    DEFAULT_TRUST_SCORE
}

fn default_prelim() -> bool {
    true
}

/// Logical connective of an operator entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    /// Conjunction (min).
    And,
    /// Disjunction (max).
    Or,
    /// Negation (sign flip).
    Not,
    /// Non-committal: `1 - 2|x|`.
    Non,
}

impl OperatorKind {
    /// Whether `n` children is a valid arity for this connective.
    pub fn accepts_arity(&self, n: usize) -> bool {
        match self {
            Self::And | Self::Or => n >= 2,
            Self::Not | Self::Non => n == 1,
        }
    }

    /// Human readable arity requirement.
    pub fn arity_requirement(&self) -> &'static str {
        match self {
            Self::And | Self::Or => "at least 2",
            Self::Not | Self::Non => "exactly 1",
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "and"),
            Self::Or => write!(f, "or"),
            Self::Not => write!(f, "not"),
            Self::Non => write!(f, "non"),
        }
    }
}

/// Variant-specific payload of a trust entry.
///
/// Serialized with an internal `"type"` tag so feed lines read as
/// `{"type":"and","id":"d1","children":["f1","f2"],...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    /// Authored evidence.
    Fact,
    /// Evidence pointing at an outside source.
    Reference {
        /// Where the referenced material lives, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// Conjunction over children.
    And {
        /// Referenced entry ids.
        children: Vec<EntryId>,
    },
    /// Disjunction over children.
    Or {
        /// Referenced entry ids.
        children: Vec<EntryId>,
    },
    /// Negation of a single child.
    Not {
        /// Referenced entry ids.
        children: Vec<EntryId>,
    },
    /// Non-committal transform of a single child.
    Non {
        /// Referenced entry ids.
        children: Vec<EntryId>,
    },
    /// Delegated pointer to a remote trust table.
    Authority {
        /// Fetch target.
        url: String,
        /// Informational identity (e.g. a DID).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity_ref: Option<String>,
        /// Cache TTL in seconds.
        #[serde(default = "default_refresh")]
        refresh: u64,
    },
    /// External answering agent.
    Provider {
        /// Opaque handle the provider client uses to reach the agent.
        endpoint_ref: String,
        /// Observed honesty, adjusted over time.
        #[serde(default = "default_trust_score")]
        trust_score: f64,
        /// Whether this provider sees the alpha's preliminary answer.
        #[serde(default = "default_prelim")]
        prelim: bool,
    },
}

impl EntryKind {
    /// Operator connective and children, if this is an operator.
    pub fn operator(&self) -> Option<(OperatorKind, &[EntryId])> {
        match self {
            Self::And { children } => Some((OperatorKind::And, children)),
            Self::Or { children } => Some((OperatorKind::Or, children)),
            Self::Not { children } => Some((OperatorKind::Not, children)),
            Self::Non { children } => Some((OperatorKind::Non, children)),
            _ => None,
        }
    }

    /// Mutable children, if this is an operator.
    pub fn children_mut(&mut self) -> Option<&mut Vec<EntryId>> {
        match self {
            Self::And { children }
            | Self::Or { children }
            | Self::Not { children }
            | Self::Non { children } => Some(children),
            _ => None,
        }
    }

    /// Build an operator payload.
    pub fn from_operator(op: OperatorKind, children: Vec<EntryId>) -> Self {
        match op {
            OperatorKind::And => Self::And { children },
            OperatorKind::Or => Self::Or { children },
            OperatorKind::Not => Self::Not { children },
            OperatorKind::Non => Self::Non { children },
        }
    }

    /// Whether this variant belongs to the evaluable static set.
    pub fn is_static(&self) -> bool {
        matches!(self, Self::Fact | Self::Reference { .. })
    }

    /// Short name of the variant, matching the serialized tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Reference { .. } => "reference",
            Self::And { .. } => "and",
            Self::Or { .. } => "or",
            Self::Not { .. } => "not",
            Self::Non { .. } => "non",
            Self::Authority { .. } => "authority",
            Self::Provider { .. } => "provider",
        }
    }
}

/// Where a materialized entry came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum Provenance {
    /// Imported through an authority.
    Authority {
        /// Importing authority entry.
        authority_id: EntryId,
        /// Feed location.
        url: String,
        /// SHA-256 of the fetched feed bytes.
        feed_digest: String,
    },
    /// Produced by a provider during a vote.
    Provider {
        /// Source provider entry.
        provider_id: EntryId,
        /// Role the provider held when answering.
        role: VoteRole,
        /// Alpha ancestry at the time of the call, root first.
        chain: Vec<EntryId>,
    },
}

/// Atomic unit of evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustEntry {
    /// Unique, immutable id.
    pub id: EntryId,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Belief in `[-1, +1]`.
    #[serde(deserialize_with = "de_certainty")]
    pub certainty: f64,
    /// When the entry was authored.
    #[serde(default = "epoch")]
    pub timestamp: DateTime<Utc>,
    /// Opaque display content. Never evaluated.
    #[serde(default)]
    pub content: String,
    /// Variant payload.
    #[serde(flatten)]
    pub kind: EntryKind,
    /// Set on entries materialized by this crate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

impl TrustEntry {
    /// Create an entry of any kind. Certainty is clamped.
    pub fn new(id: impl Into<EntryId>, certainty: f64, kind: EntryKind) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            certainty: clamp_certainty(certainty),
            timestamp: epoch(),
            content: String::new(),
            kind,
            provenance: None,
        }
    }

    /// Create a fact.
    pub fn fact(id: impl Into<EntryId>, certainty: f64) -> Self {
        Self::new(id, certainty, EntryKind::Fact)
    }

    /// Create a reference.
    pub fn reference(id: impl Into<EntryId>, certainty: f64, source: Option<String>) -> Self {
        Self::new(id, certainty, EntryKind::Reference { source })
    }

    /// Create an operator with an authored certainty of 0.
    pub fn operator<I, C>(id: impl Into<EntryId>, op: OperatorKind, children: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<EntryId>,
    {
        let children = children.into_iter().map(Into::into).collect();
        Self::new(id, 0.0, EntryKind::from_operator(op, children))
    }

    /// Create an authority with the default refresh.
    pub fn authority(id: impl Into<EntryId>, certainty: f64, url: impl Into<String>) -> Self {
        Self::new(
            id,
            certainty,
            EntryKind::Authority {
                url: url.into(),
                identity_ref: None,
                refresh: DEFAULT_REFRESH_SECS,
            },
        )
    }

    /// Create a provider that sees preliminary answers.
    pub fn provider(id: impl Into<EntryId>, certainty: f64, endpoint_ref: impl Into<String>) -> Self {
        Self::new(
            id,
            certainty,
            EntryKind::Provider {
                endpoint_ref: endpoint_ref.into(),
                trust_score: DEFAULT_TRUST_SCORE,
                prelim: true,
            },
        )
    }

    /// Set the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Set the content.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Set the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the authored certainty (clamped).
    pub fn with_certainty(mut self, certainty: f64) -> Self {
        self.certainty = clamp_certainty(certainty);
        self
    }

    /// Set the `prelim` flag. No effect on non-provider entries.
    pub fn with_prelim(mut self, value: bool) -> Self {
        if let EntryKind::Provider { prelim, .. } = &mut self.kind {
            *prelim = value;
        }
        self
    }

    /// Set the authority refresh. No effect on non-authority entries.
    pub fn with_refresh(mut self, secs: u64) -> Self {
        if let EntryKind::Authority { refresh, .. } = &mut self.kind {
            *refresh = secs;
        }
        self
    }

    /// Attach provenance.
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// Whether this entry is a fact or reference.
    pub fn is_static(&self) -> bool {
        self.kind.is_static()
    }
}
