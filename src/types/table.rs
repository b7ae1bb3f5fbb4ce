//! Truth tables and partitioning.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::entry::{EntryId, TrustEntry};

/// Error type for truth table construction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TableError {
    /// Two entries share an id.
    #[error("Duplicate entry id: {0}")]
    DuplicateId(EntryId),
    /// A line of a table file did not parse.
    #[error("Malformed table line {line}: {reason}")]
    MalformedLine {
        /// 1-based line number.
        line: usize,
        /// Parser message.
        reason: String,
    },
}

/// Mapping `id -> TrustEntry`, supplied fresh per request.
///
/// Uses a BTreeMap so every traversal is in id order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<TrustEntry>", into = "Vec<TrustEntry>")]
pub struct TruthTable {
    entries: BTreeMap<EntryId, TrustEntry>,
}

impl TruthTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table, rejecting duplicate ids.
    pub fn from_entries(entries: impl IntoIterator<Item = TrustEntry>) -> Result<Self, TableError> {
        let mut table = Self::new();
        for entry in entries {
            table.insert(entry)?;
        }
        Ok(table)
    }

    /// Parse a JSON-lines table. Blank lines are ignored; every other line
    /// must be a trust entry.
    pub fn from_json_lines(text: &str) -> Result<Self, TableError> {
        let mut table = Self::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: TrustEntry = serde_json::from_str(line).map_err(|e| TableError::MalformedLine {
                line: idx + 1,
                reason: e.to_string(),
            })?;
            table.insert(entry)?;
        }
        Ok(table)
    }

    /// Insert an entry. Fails if the id is already present.
    pub fn insert(&mut self, entry: TrustEntry) -> Result<(), TableError> {
        if self.entries.contains_key(&entry.id) {
            return Err(TableError::DuplicateId(entry.id));
        }
        self.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Look up an entry.
    pub fn get(&self, id: &str) -> Option<&TrustEntry> {
        self.entries.get(id)
    }

    /// Mutable access restricted to the certainty of one entry.
    pub(crate) fn set_certainty(&mut self, id: &EntryId, certainty: f64) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.certainty = certainty;
        }
    }

    /// Iterate entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = &TrustEntry> {
        self.entries.values()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split into the evaluable static set and the structural set.
    ///
    /// Partitioning decides evaluation order only; both halves are still
    /// delivered in the final bundle.
    pub fn partition(&self) -> Partition<'_> {
        let (static_set, structural_set): (Vec<_>, Vec<_>) =
            self.entries.values().partition(|e| e.is_static());
        Partition {
            static_set,
            structural_set,
        }
    }
}

impl TryFrom<Vec<TrustEntry>> for TruthTable {
    type Error = TableError;

    fn try_from(entries: Vec<TrustEntry>) -> Result<Self, Self::Error> {
        Self::from_entries(entries)
    }
}

impl From<TruthTable> for Vec<TrustEntry> {
    fn from(table: TruthTable) -> Self {
        table.entries.into_values().collect()
    }
}

/// Static/structural split of a table, borrowed from it.
#[derive(Debug, Clone)]
pub struct Partition<'a> {
    /// Facts and references.
    pub static_set: Vec<&'a TrustEntry>,
    /// Operators, authorities and providers.
    pub structural_set: Vec<&'a TrustEntry>,
}

impl<'a> Partition<'a> {
    /// Authority entries of the structural set.
    pub fn authorities(&self) -> impl Iterator<Item = &'a TrustEntry> + '_ {
        self.structural_set
            .iter()
            .copied()
            .filter(|e| matches!(e.kind, super::EntryKind::Authority { .. }))
    }

    /// Provider entries of the structural set.
    pub fn providers(&self) -> impl Iterator<Item = &'a TrustEntry> + '_ {
        self.structural_set
            .iter()
            .copied()
            .filter(|e| matches!(e.kind, super::EntryKind::Provider { .. }))
    }

    /// Operator entries of the structural set.
    pub fn operators(&self) -> impl Iterator<Item = &'a TrustEntry> + '_ {
        self.structural_set
            .iter()
            .copied()
            .filter(|e| e.kind.operator().is_some())
    }
}
