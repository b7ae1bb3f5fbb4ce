//! Parsing of line-delimited remote feeds.
//!
//! A feed is JSON lines. Only evaluable trust records survive: facts,
//! references and operators. Headers, conversation records, providers,
//! malformed lines and nested authorities are skipped. Nested authorities
//! are never followed; federation is one hop.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::types::TrustEntry;

const EVALUABLE_TYPES: &[&str] = &["fact", "reference", "and", "or", "not", "non"];

/// Counts of skipped feed lines by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounts {
    /// Lines that were not valid JSON objects or failed to deserialize.
    pub malformed: usize,
    /// Headers, conversation records and unknown record types.
    pub non_trust: usize,
    /// Authority records (dropped, never fetched).
    pub nested_authority: usize,
    /// Provider records.
    pub provider: usize,
    /// Repeated ids within the feed.
    pub duplicate: usize,
}

impl SkipCounts {
    /// Total skipped lines.
    pub fn total(&self) -> usize {
        self.malformed + self.non_trust + self.nested_authority + self.provider + self.duplicate
    }
}

/// Result of parsing one feed.
#[derive(Debug, Clone, Default)]
pub struct FeedParse {
    /// Evaluable records, in feed order.
    pub records: Vec<TrustEntry>,
    /// Lines skipped by reason.
    pub skipped: SkipCounts,
    /// Whether a record that would have been kept was dropped at the entry cap.
    pub truncated: bool,
}

/// Error type for feed parsing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedError {
    /// Body is not UTF-8.
    #[error("Feed is not valid UTF-8: {0}")]
    NotUtf8(String),
}

/// Parse feed bytes, keeping at most `max_entries` records.
pub fn parse_feed(bytes: &[u8], max_entries: usize) -> Result<FeedParse, FeedError> {
    let text = std::str::from_utf8(bytes).map_err(|e| FeedError::NotUtf8(e.to_string()))?;
    let mut parse = FeedParse::default();
    let mut seen: HashSet<String> = HashSet::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(v @ Value::Object(_)) => v,
            _ => {
                parse.skipped.malformed += 1;
                continue;
            }
        };

        match value.get("type").and_then(Value::as_str) {
            Some("authority") => {
                parse.skipped.nested_authority += 1;
                continue;
            }
            Some("provider") => {
                parse.skipped.provider += 1;
                continue;
            }
            Some(t) if EVALUABLE_TYPES.contains(&t) => {}
            _ => {
                parse.skipped.non_trust += 1;
                continue;
            }
        }

        match serde_json::from_value::<TrustEntry>(value) {
            Ok(mut entry) => {
                if !seen.insert(entry.id.as_str().to_string()) {
                    parse.skipped.duplicate += 1;
                    continue;
                }
                if parse.records.len() >= max_entries {
                    parse.truncated = true;
                    warn!(max_entries, "feed truncated at entry cap");
                    break;
                }
                // Remote provenance is not trusted; the importer stamps its own.
                entry.provenance = None;
                parse.records.push(entry);
            }
            Err(e) => {
                debug!(error = %e, "malformed trust record in feed");
                parse.skipped.malformed += 1;
            }
        }
    }

    Ok(parse)
}
