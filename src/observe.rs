//! Observability hooks for degraded or surprising evaluation outcomes.
//!
//! None of these events fail a turn. They exist so operators can see when
//! the engine fell back to best effort.
//!
//! | Event | Severity | Meaning |
//! |-------|----------|---------|
//! | NonConvergence | MEDIUM | Fixed point not reached within the round cap |
//! | DisbeliefOverridden | LOW | A derived value flipped an authored disbelief |
//! | InvalidOperator | LOW | Operator skipped for arity or dangling child |
//! | AuthorityDegraded | MEDIUM | Authority contributed nothing this turn |
//! | CycleExcluded | LOW | Beta silenced because it is already an ancestor |
//! | ProviderFailed | MEDIUM | Provider call errored or timed out |
//! | DeadlineExpired | HIGH | Turn deadline abandoned in-flight work |

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{EntryId, VoteRole};

/// Severity levels for engine events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Expected under normal operation.
    Low,
    /// Degraded result, worth a look.
    Medium,
    /// Work was abandoned.
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Something worth surfacing that happened during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Round cap reached before the delta fell below epsilon.
    NonConvergence {
        /// Rounds executed.
        rounds: u32,
        /// Largest change in the last round.
        final_delta: f64,
    },
    /// Operator authored as disbelieved but derived as believed.
    DisbeliefOverridden {
        /// Operator entry.
        entry_id: EntryId,
        /// Caller-supplied certainty.
        authored: f64,
        /// Evaluated certainty.
        derived: f64,
    },
    /// Operator excluded from evaluation.
    InvalidOperator {
        /// Operator entry.
        entry_id: EntryId,
        /// Validation message.
        reason: String,
    },
    /// Authority import failed and contributed nothing.
    AuthorityDegraded {
        /// Authority entry.
        authority_id: EntryId,
        /// Fetch target.
        url: String,
        /// Failure message.
        reason: String,
    },
    /// Beta excluded because it already appears in the call chain.
    CycleExcluded {
        /// Excluded provider.
        provider_id: EntryId,
        /// Ancestry at the time of exclusion.
        chain: Vec<EntryId>,
    },
    /// Provider invocation failed or timed out.
    ProviderFailed {
        /// Provider entry.
        provider_id: EntryId,
        /// Role it was invoked in.
        role: VoteRole,
        /// Failure message.
        reason: String,
    },
    /// The turn deadline passed with work still in flight.
    DeadlineExpired {
        /// Pipeline stage that was cut short.
        stage: String,
        /// Tasks abandoned.
        abandoned: usize,
    },
}

impl EngineEvent {
    /// Get the severity of this event.
    pub fn severity(&self) -> Severity {
        match self {
            Self::NonConvergence { .. } => Severity::Medium,
            Self::DisbeliefOverridden { .. } => Severity::Low,
            Self::InvalidOperator { .. } => Severity::Low,
            Self::AuthorityDegraded { .. } => Severity::Medium,
            Self::CycleExcluded { .. } => Severity::Low,
            Self::ProviderFailed { .. } => Severity::Medium,
            Self::DeadlineExpired { .. } => Severity::High,
        }
    }

    /// Get the counter name for this event.
    pub fn metric_name(&self) -> &'static str {
        match self {
            Self::NonConvergence { .. } => "trust_kernel_non_convergence_total",
            Self::DisbeliefOverridden { .. } => "trust_kernel_disbelief_overridden_total",
            Self::InvalidOperator { .. } => "trust_kernel_invalid_operators_total",
            Self::AuthorityDegraded { .. } => "trust_kernel_authority_degraded_total",
            Self::CycleExcluded { .. } => "trust_kernel_cycle_exclusions_total",
            Self::ProviderFailed { .. } => "trust_kernel_provider_failures_total",
            Self::DeadlineExpired { .. } => "trust_kernel_deadline_expired_total",
        }
    }

    /// Log this event as a structured tracing event.
    pub fn log(&self) {
        match self.severity() {
            Severity::Low => tracing::debug!(
                metric = self.metric_name(),
                event = ?self,
                "engine event"
            ),
            Severity::Medium | Severity::High => tracing::warn!(
                metric = self.metric_name(),
                severity = %self.severity(),
                event = ?self,
                "engine event"
            ),
        }
    }
}

/// Sink for engine events.
pub trait EngineObserver: Send + Sync {
    /// Record one event.
    fn record(&self, event: &EngineEvent);
}

/// Log an event and hand it to the observer.
pub fn emit(observer: &dyn EngineObserver, event: EngineEvent) {
    event.log();
    observer.record(&event);
}

/// Observer that discards events (they are still logged by `emit`).
#[derive(Debug, Default)]
pub struct NoOpObserver;

impl EngineObserver for NoOpObserver {
    fn record(&self, _event: &EngineEvent) {}
}

/// In-memory observer for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingObserver {
    /// Create a shareable recorder.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events with the given metric name.
    pub fn count(&self, metric_name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.metric_name() == metric_name)
            .count()
    }
}

impl EngineObserver for RecordingObserver {
    fn record(&self, event: &EngineEvent) {
        self.events.lock().push(event.clone());
    }
}
