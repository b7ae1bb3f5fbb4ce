//! Evidence bundle assembly.
//!
//! The bundle forwards everything: the caller's table (with evaluated
//! operator certainties), then authority imports, then provider answers,
//! then history and static context. Partitioning only decides evaluation
//! order; it never filters delivery. Bounded subsets are taken afterwards
//! with [`EvidenceBundle::select`].

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::canonical::canonical_hash_hex;
use crate::config::SelectionPolicy;
use crate::types::{EntryId, HistoryMessage, TableError, TrustEntry, TruthTable};

/// Bundle schema version.
pub const BUNDLE_SCHEMA_VERSION: &str = "evidence_bundle_v1";

/// Where a bundle entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrigin {
    /// Caller's table.
    Table,
    /// Imported through an authority.
    Authority,
    /// Produced by a provider during the vote.
    Provider,
}

/// One entry in a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleEntry {
    /// The entry.
    pub entry: TrustEntry,
    /// Its origin.
    pub origin: EntryOrigin,
}

/// Everything handed to the synthesis step for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBundle {
    /// Schema version.
    pub version: String,
    /// Entries in dependency order.
    pub entries: Vec<BundleEntry>,
    /// Caller-supplied conversation history.
    pub history: Vec<HistoryMessage>,
    /// Caller-supplied static context.
    pub static_context: Vec<String>,
    /// Hash of the engine config that produced this bundle.
    pub config_hash: String,
    /// Content hash over entries, history, context and config hash.
    pub fingerprint: String,
    /// Assembly time.
    pub assembled_at: DateTime<Utc>,
}

impl EvidenceBundle {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by id.
    pub fn get(&self, id: &str) -> Option<&TrustEntry> {
        self.entries
            .iter()
            .find(|b| b.entry.id.as_str() == id)
            .map(|b| &b.entry)
    }

    /// Entries with the given origin, in bundle order.
    pub fn from_origin(&self, origin: EntryOrigin) -> impl Iterator<Item = &TrustEntry> {
        self.entries
            .iter()
            .filter(move |b| b.origin == origin)
            .map(|b| &b.entry)
    }

    /// Bounded subset: drop `|certainty|` below the minimum, rank by
    /// `|certainty|` descending then id, keep at most `max_entries`.
    pub fn select(&self, policy: &SelectionPolicy) -> Vec<&BundleEntry> {
        let mut selected: Vec<&BundleEntry> = self
            .entries
            .iter()
            .filter(|b| b.entry.certainty.abs() >= policy.min_certainty)
            .collect();
        selected.sort_by(|a, b| {
            b.entry
                .certainty
                .abs()
                .total_cmp(&a.entry.certainty.abs())
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        selected.truncate(policy.max_entries);
        selected
    }

    /// The expanded table: original, imported and provider entries.
    pub fn to_table(&self) -> Result<TruthTable, TableError> {
        TruthTable::from_entries(self.entries.iter().map(|b| b.entry.clone()))
    }
}

/// Assembles bundles for one engine configuration.
#[derive(Debug, Clone)]
pub struct BundleAssembler {
    config_hash: String,
}

impl BundleAssembler {
    /// Create an assembler stamping bundles with `config_hash`.
    pub fn new(config_hash: impl Into<String>) -> Self {
        Self {
            config_hash: config_hash.into(),
        }
    }

    /// Merge all turn outputs in dependency order.
    ///
    /// Later entries whose id is already present are dropped, so the
    /// caller's table always wins.
    pub fn assemble(
        &self,
        table: &TruthTable,
        imported: Vec<TrustEntry>,
        provider_entries: Vec<TrustEntry>,
        history: Vec<HistoryMessage>,
        static_context: Vec<String>,
    ) -> EvidenceBundle {
        let mut seen: HashSet<EntryId> = HashSet::with_capacity(table.len() + imported.len());
        let mut entries = Vec::with_capacity(table.len() + imported.len() + provider_entries.len());

        for entry in table.iter() {
            seen.insert(entry.id.clone());
            entries.push(BundleEntry {
                entry: entry.clone(),
                origin: EntryOrigin::Table,
            });
        }

        let later = imported
            .into_iter()
            .map(|e| (e, EntryOrigin::Authority))
            .chain(provider_entries.into_iter().map(|e| (e, EntryOrigin::Provider)));
        for (entry, origin) in later {
            if !seen.insert(entry.id.clone()) {
                warn!(id = %entry.id, ?origin, "duplicate id in bundle, dropping");
                continue;
            }
            entries.push(BundleEntry { entry, origin });
        }

        let fingerprint = canonical_hash_hex(&(&entries, &history, &static_context, &self.config_hash));

        EvidenceBundle {
            version: BUNDLE_SCHEMA_VERSION.to_string(),
            entries,
            history,
            static_context,
            config_hash: self.config_hash.clone(),
            fingerprint,
            assembled_at: Utc::now(),
        }
    }
}
