//! Engine configuration.
//!
//! ## Float Normalization for Deterministic Hashing
//!
//! Floats are quantized to integers before hashing so the config hash
//! recorded in every bundle is stable across platforms. The quantization
//! factor is 1e6 (multiply by 1,000,000 and round to i64); the convergence
//! epsilon is hashed via its bit pattern since it is far below 1e-6.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_hash_hex;

/// Quantization factor for float normalization.
const FLOAT_QUANTIZATION_FACTOR: f64 = 1_000_000.0;

/// Config schema identifier.
pub const DEFAULT_CONFIG_VERSION: &str = "trust_kernel_config_v1";

/// Fixed-point evaluation limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationLimits {
    /// Stop once the largest round-over-round change is below this.
    pub epsilon: f64,
    /// Hard cap on rounds.
    pub max_rounds: u32,
}

impl Default for EvaluationLimits {
    fn default() -> Self {
        Self {
            epsilon: 1e-9,
            max_rounds: 100,
        }
    }
}

/// Authority fetch limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchLimits {
    /// Feeds larger than this fail the authority.
    pub max_feed_bytes: usize,
    /// Feeds are truncated after this many kept records.
    pub max_feed_entries: usize,
    /// Per-fetch timeout in milliseconds.
    pub fetch_timeout_ms: u64,
    /// Root that `file` URLs must resolve under. `None` disables local feeds.
    pub allowed_file_root: Option<PathBuf>,
    /// Maximum number of cached feeds.
    pub cache_capacity: usize,
    /// Maximum authorities resolved at once.
    pub max_concurrent_fetches: usize,
}

impl FetchLimits {
    /// Per-fetch timeout.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_feed_bytes: 1024 * 1024,
            max_feed_entries: 1000,
            fetch_timeout_ms: 10_000,
            allowed_file_root: None,
            cache_capacity: 256,
            max_concurrent_fetches: 8,
        }
    }
}

/// Voting limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VotingLimits {
    /// Per-invocation timeout in milliseconds.
    pub provider_timeout_ms: u64,
    /// Maximum betas invoked at once.
    pub max_concurrency: usize,
}

impl VotingLimits {
    /// Per-invocation timeout.
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }
}

impl Default for VotingLimits {
    fn default() -> Self {
        Self {
            provider_timeout_ms: 30_000,
            max_concurrency: 8,
        }
    }
}

/// Bounded subset selection over a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionPolicy {
    /// Entries with `|certainty|` below this are dropped.
    pub min_certainty: f64,
    /// At most this many entries are kept.
    pub max_entries: usize,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            min_certainty: 0.0,
            max_entries: 64,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Config version identifier.
    pub version: String,
    /// Operator evaluation.
    pub evaluation: EvaluationLimits,
    /// Authority fetches.
    pub fetch: FetchLimits,
    /// Provider voting.
    pub voting: VotingLimits,
    /// Bundle subset selection.
    pub selection: SelectionPolicy,
    /// Default per-turn deadline in milliseconds.
    pub turn_deadline_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_CONFIG_VERSION.to_string(),
            evaluation: EvaluationLimits::default(),
            fetch: FetchLimits::default(),
            voting: VotingLimits::default(),
            selection: SelectionPolicy::default(),
            turn_deadline_ms: 60_000,
        }
    }
}

impl EngineConfig {
    /// Default per-turn deadline.
    pub fn turn_deadline(&self) -> Duration {
        Duration::from_millis(self.turn_deadline_ms)
    }

    /// Build a config from defaults overridden by environment variables.
    ///
    /// Recognized variables:
    /// - `TRUST_KERNEL_MAX_ROUNDS`
    /// - `TRUST_KERNEL_MAX_FEED_BYTES`
    /// - `TRUST_KERNEL_MAX_FEED_ENTRIES`
    /// - `TRUST_KERNEL_FETCH_TIMEOUT_MS`
    /// - `TRUST_KERNEL_FILE_ROOT`
    /// - `TRUST_KERNEL_PROVIDER_TIMEOUT_MS`
    /// - `TRUST_KERNEL_TURN_DEADLINE_MS`
    /// - `TRUST_KERNEL_MIN_CERTAINTY`
    /// - `TRUST_KERNEL_MAX_ENTRIES`
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        env_override("TRUST_KERNEL_MAX_ROUNDS", &mut config.evaluation.max_rounds);
        env_override("TRUST_KERNEL_MAX_FEED_BYTES", &mut config.fetch.max_feed_bytes);
        env_override("TRUST_KERNEL_MAX_FEED_ENTRIES", &mut config.fetch.max_feed_entries);
        env_override("TRUST_KERNEL_FETCH_TIMEOUT_MS", &mut config.fetch.fetch_timeout_ms);
        env_override("TRUST_KERNEL_PROVIDER_TIMEOUT_MS", &mut config.voting.provider_timeout_ms);
        env_override("TRUST_KERNEL_TURN_DEADLINE_MS", &mut config.turn_deadline_ms);
        env_override("TRUST_KERNEL_MIN_CERTAINTY", &mut config.selection.min_certainty);
        env_override("TRUST_KERNEL_MAX_ENTRIES", &mut config.selection.max_entries);
        if let Ok(root) = std::env::var("TRUST_KERNEL_FILE_ROOT") {
            config.fetch.allowed_file_root = Some(PathBuf::from(root));
        }
        config
    }

    /// Compute a hash of the configuration.
    ///
    /// Uses the quantized representation so equal configs hash equally
    /// regardless of float formatting.
    pub fn params_hash(&self) -> String {
        canonical_hash_hex(&self.to_quantized())
    }

    fn to_quantized(&self) -> QuantizedConfig {
        QuantizedConfig {
            version: self.version.clone(),
            epsilon_bits: self.evaluation.epsilon.to_bits(),
            max_rounds: self.evaluation.max_rounds,
            max_feed_bytes: self.fetch.max_feed_bytes,
            max_feed_entries: self.fetch.max_feed_entries,
            fetch_timeout_ms: self.fetch.fetch_timeout_ms,
            allowed_file_root: self
                .fetch
                .allowed_file_root
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            provider_timeout_ms: self.voting.provider_timeout_ms,
            min_certainty: quantize_float(self.selection.min_certainty),
            max_entries: self.selection.max_entries,
        }
    }

    /// Create a config with short timeouts for testing.
    #[cfg(test)]
    pub fn minimal() -> Self {
        let mut config = Self::default();
        config.fetch.fetch_timeout_ms = 500;
        config.voting.provider_timeout_ms = 500;
        config.turn_deadline_ms = 2_000;
        config
    }
}

fn env_override<T: FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(variable = name, value = %raw, "ignoring unparseable config override"),
        }
    }
}

/// Quantize a float to an i64 for deterministic hashing.
fn quantize_float(value: f64) -> i64 {
    (value * FLOAT_QUANTIZATION_FACTOR).round() as i64
}

/// Quantized config parameters for deterministic hashing.
#[derive(Debug, Clone, Serialize)]
struct QuantizedConfig {
    version: String,
    epsilon_bits: u64,
    max_rounds: u32,
    max_feed_bytes: usize,
    max_feed_entries: usize,
    fetch_timeout_ms: u64,
    allowed_file_root: Option<String>,
    provider_timeout_ms: u64,
    min_certainty: i64,
    max_entries: usize,
}
