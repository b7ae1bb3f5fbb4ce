//! Provider trust-score adjustment.
//!
//! Trust formula: `(validated + useful) / (total + 1) × (1 - contradicted / (total + 1))`
//!
//! The product makes contradictions weigh more than validations: a provider
//! with 5 validated, 3 useful and 1 contradicted out of 10 statements scores
//! `8/11 × 10/11 ≈ 0.661`. Only verifiable claims and citations can be
//! validated or contradicted; subjective statements count toward the total.
//!
//! Scores are bookkeeping for the caller. Ranking, fan-out and cycle
//! prevention never read them.

use serde::{Deserialize, Serialize};

use super::classify::StatementKind;
use crate::types::{EntryKind, TrustEntry};

/// Later judgement about one classified statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// Checked and found true.
    Validated,
    /// Found helpful by the caller.
    Useful,
    /// Checked and found false.
    Contradicted,
    /// Not judged.
    Unchecked,
}

/// Accumulated evidence about one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEvidence {
    /// Statements found true.
    pub validated: u64,
    /// Statements contradicted.
    pub contradicted: u64,
    /// Statements found useful.
    pub useful: u64,
    /// Statements observed.
    pub total: u64,
}

impl TrustEvidence {
    /// Record one judged statement.
    pub fn observe(&mut self, kind: StatementKind, outcome: ClaimOutcome) {
        self.total += 1;
        let checkable = !matches!(kind, StatementKind::Subjective);
        match outcome {
            ClaimOutcome::Validated if checkable => self.validated += 1,
            ClaimOutcome::Contradicted if checkable => self.contradicted += 1,
            ClaimOutcome::Useful => self.useful += 1,
            _ => {}
        }
    }

    /// Score in `[0, 1]`, or `None` with no evidence.
    pub fn score(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        let total = self.total as f64;
        let positive = (self.validated + self.useful) as f64;
        let negative = self.contradicted as f64;
        let trust = (positive / (total + 1.0)) * (1.0 - negative / (total + 1.0));
        Some(trust.clamp(0.0, 1.0))
    }
}

/// Recompute a provider's trust score from evidence.
///
/// Returns the new score, or `None` if the entry is not a provider or there
/// is no evidence (the score is left unchanged).
pub fn adjust_trust_score(provider: &mut TrustEntry, evidence: &TrustEvidence) -> Option<f64> {
    let EntryKind::Provider { trust_score, .. } = &mut provider.kind else {
        return None;
    };
    let next = evidence.score()?;
    tracing::debug!(
        provider = %provider.id,
        previous = *trust_score,
        next,
        "adjusting provider trust score"
    );
    *trust_score = next;
    Some(next)
}
