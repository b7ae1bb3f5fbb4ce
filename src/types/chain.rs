//! Alpha ancestry for nested votes.
//!
//! A `CallChain` is a persistent, append-only list. `push` never mutates the
//! receiver; it returns a new chain sharing the old one as its tail, so
//! sibling branches of a fan-out each hold their own ancestry.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::entry::EntryId;

#[derive(Debug)]
struct Link {
    id: EntryId,
    parent: Option<Arc<Link>>,
    len: usize,
}

/// Ordered ancestry of provider ids that have held the alpha role.
#[derive(Debug, Clone, Default)]
pub struct CallChain {
    head: Option<Arc<Link>>,
}

impl CallChain {
    /// Empty chain for a root vote.
    pub fn root() -> Self {
        Self::default()
    }

    /// Return a new chain with `id` appended.
    pub fn push(&self, id: EntryId) -> Self {
        let len = self.len() + 1;
        Self {
            head: Some(Arc::new(Link {
                id,
                parent: self.head.clone(),
                len,
            })),
        }
    }

    /// Whether `id` appears anywhere in the ancestry.
    pub fn contains(&self, id: &EntryId) -> bool {
        self.iter_rev().any(|link_id| link_id == id)
    }

    /// Number of ids in the chain.
    pub fn len(&self) -> usize {
        self.head.as_ref().map_or(0, |l| l.len)
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Most recently appended id.
    pub fn last(&self) -> Option<&EntryId> {
        self.head.as_ref().map(|l| &l.id)
    }

    /// Ids from the root down to the newest.
    pub fn ids(&self) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self.iter_rev().cloned().collect();
        ids.reverse();
        ids
    }

    fn iter_rev(&self) -> impl Iterator<Item = &EntryId> {
        let mut cursor = self.head.as_deref();
        std::iter::from_fn(move || {
            let link = cursor?;
            cursor = link.parent.as_deref();
            Some(&link.id)
        })
    }
}

impl FromIterator<EntryId> for CallChain {
    fn from_iter<T: IntoIterator<Item = EntryId>>(iter: T) -> Self {
        iter.into_iter().fold(Self::root(), |chain, id| chain.push(id))
    }
}

impl PartialEq for CallChain {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter_rev().eq(other.iter_rev())
    }
}

impl Eq for CallChain {}

impl fmt::Display for CallChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = self.ids();
        let parts: Vec<&str> = ids.iter().map(EntryId::as_str).collect();
        write!(f, "[{}]", parts.join(" -> "))
    }
}

impl Serialize for CallChain {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.ids().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CallChain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ids = Vec::<EntryId>::deserialize(deserializer)?;
        Ok(ids.into_iter().collect())
    }
}

/// Role a provider holds in one round of voting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteRole {
    /// First alpha call, answering the bare query.
    AlphaPrelim,
    /// Secondary voice.
    Beta,
    /// Second alpha call, synthesizing all answers.
    AlphaFinal,
}

impl VoteRole {
    /// Suffix used for ids of entries materialized from this role.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::AlphaPrelim => "alpha_prelim",
            Self::Beta => "beta",
            Self::AlphaFinal => "alpha_final",
        }
    }
}

impl fmt::Display for VoteRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}
