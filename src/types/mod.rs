//! Core types for the trust kernel.

pub mod entry;
pub mod chain;
pub mod table;
pub mod history;

pub use entry::{
    EntryId, EntryKind, OperatorKind, Provenance, TrustEntry, clamp_certainty,
    DEFAULT_REFRESH_SECS, DEFAULT_TRUST_SCORE,
};
pub use chain::{CallChain, VoteRole};
pub use table::{Partition, TableError, TruthTable};
pub use history::{HistoryMessage, Role};
