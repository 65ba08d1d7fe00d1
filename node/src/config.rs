//! Pipeline configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use strata_state::{StateStrategy, DEFAULT_STALE_AFTER_ROUNDS};
use strata_types::{NodeId, Timestamp};

use crate::{LogFormat, NodeError};

/// Configuration for one strata pipeline.
///
/// Can be loaded from a TOML file via [`PipelineConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// This node's id; self-created events carry it.
    #[serde(default)]
    pub self_id: u64,

    /// Capacity of the bounded pre-consensus event queue.
    #[serde(default = "default_pre_consensus_queue_capacity")]
    pub pre_consensus_queue_capacity: usize,

    /// Capacity of the bounded consensus round queue.
    #[serde(default = "default_consensus_queue_capacity")]
    pub consensus_queue_capacity: usize,

    /// Capacity of the self-transaction pool.
    #[serde(default = "default_transaction_pool_capacity")]
    pub transaction_pool_capacity: usize,

    /// Byte budget for the transactions of one self-created event.
    #[serde(default = "default_max_transaction_bytes_per_event")]
    pub max_transaction_bytes_per_event: usize,

    /// Largest single self transaction the pool accepts.
    #[serde(default = "default_transaction_max_bytes")]
    pub transaction_max_bytes: usize,

    /// Sign every round that is a multiple of this; below 1 only round 1 and
    /// the freeze round are signed.
    #[serde(default = "default_signed_state_frequency")]
    pub signed_state_frequency: i64,

    #[serde(default)]
    pub state_strategy: StateStrategy,

    /// Fixed delay between shuffles (shuffled strategy only).
    #[serde(default = "default_shuffle_interval_ms")]
    pub shuffle_interval_ms: u64,

    /// Consensus rounds a self-applied event may wait for consensus before
    /// the state manager stops replaying it.
    #[serde(default = "default_stale_event_rounds")]
    pub stale_event_rounds: u64,

    /// Initial freeze time in nanoseconds since the epoch.
    #[serde(default)]
    pub freeze_time: Option<u64>,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether to register Prometheus collectors.
    #[serde(default)]
    pub enable_metrics: bool,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_pre_consensus_queue_capacity() -> usize {
    10_000
}

fn default_consensus_queue_capacity() -> usize {
    1_000
}

fn default_transaction_pool_capacity() -> usize {
    100_000
}

fn default_max_transaction_bytes_per_event() -> usize {
    245_760
}

fn default_transaction_max_bytes() -> usize {
    6_144
}

fn default_signed_state_frequency() -> i64 {
    1
}

fn default_shuffle_interval_ms() -> u64 {
    200
}

fn default_stale_event_rounds() -> u64 {
    DEFAULT_STALE_AFTER_ROUNDS
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| NodeError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        let config: Self = toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, NodeError> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), NodeError> {
        let capacities = [
            ("pre_consensus_queue_capacity", self.pre_consensus_queue_capacity),
            ("consensus_queue_capacity", self.consensus_queue_capacity),
            ("transaction_pool_capacity", self.transaction_pool_capacity),
            ("max_transaction_bytes_per_event", self.max_transaction_bytes_per_event),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(NodeError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.state_strategy == StateStrategy::Shuffled && self.shuffle_interval_ms == 0 {
            return Err(NodeError::Config(
                "shuffle_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.stale_event_rounds == 0 {
            return Err(NodeError::Config(
                "stale_event_rounds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn self_id(&self) -> NodeId {
        NodeId(self.self_id)
    }

    pub fn shuffle_interval(&self) -> Duration {
        Duration::from_millis(self.shuffle_interval_ms)
    }

    pub fn freeze_timestamp(&self) -> Option<Timestamp> {
        self.freeze_time.map(Timestamp::from_nanos)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            self_id: 0,
            pre_consensus_queue_capacity: default_pre_consensus_queue_capacity(),
            consensus_queue_capacity: default_consensus_queue_capacity(),
            transaction_pool_capacity: default_transaction_pool_capacity(),
            max_transaction_bytes_per_event: default_max_transaction_bytes_per_event(),
            transaction_max_bytes: default_transaction_max_bytes(),
            signed_state_frequency: default_signed_state_frequency(),
            state_strategy: StateStrategy::default(),
            shuffle_interval_ms: default_shuffle_interval_ms(),
            stale_event_rounds: default_stale_event_rounds(),
            freeze_time: None,
            log_format: LogFormat::default(),
            log_level: default_log_level(),
            enable_metrics: false,
        }
    }
}
