//! Transactions and their per-stage delivery markers.
//!
//! A transaction instance is delivered to pre-consensus handling at most once
//! and to consensus handling exactly once. Both facts are recorded on the
//! instance itself, so a second delivery of the same instance is detectable
//! without any process-wide bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Protocol-internal transaction types routed by the system transaction router.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemTransactionType {
    /// A node's signature over a signed state.
    StateSignature,
    /// Network latency probe.
    Ping,
    /// Bandwidth report.
    BitsPerSecond,
}

impl fmt::Display for SystemTransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StateSignature => "state_signature",
            Self::Ping => "ping",
            Self::BitsPerSecond => "bits_per_second",
        };
        f.write_str(name)
    }
}

/// Whether a transaction belongs to the application or to the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    Application,
    System(SystemTransactionType),
}

/// The two delivery stages a transaction passes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStage {
    PreConsensus,
    Consensus,
}

impl fmt::Display for DeliveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreConsensus => f.write_str("pre-consensus"),
            Self::Consensus => f.write_str("consensus"),
        }
    }
}

/// An opaque payload tagged as application or system.
#[derive(Debug, Serialize, Deserialize)]
pub struct Transaction {
    kind: TransactionKind,
    payload: Vec<u8>,
    #[serde(skip)]
    pre_consensus_delivered: AtomicBool,
    #[serde(skip)]
    consensus_delivered: AtomicBool,
}

impl Transaction {
    pub fn application(payload: Vec<u8>) -> Self {
        Self::new(TransactionKind::Application, payload)
    }

    pub fn system(kind: SystemTransactionType, payload: Vec<u8>) -> Self {
        Self::new(TransactionKind::System(kind), payload)
    }

    fn new(kind: TransactionKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            pre_consensus_delivered: AtomicBool::new(false),
            consensus_delivered: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn is_system(&self) -> bool {
        matches!(self.kind, TransactionKind::System(_))
    }

    /// The system transaction type, or `None` for application transactions.
    pub fn system_type(&self) -> Option<SystemTransactionType> {
        match self.kind {
            TransactionKind::System(ty) => Some(ty),
            TransactionKind::Application => None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Record delivery to `stage`. Returns `false` if this instance had
    /// already been delivered to that stage.
    pub fn mark_delivered(&self, stage: DeliveryStage) -> bool {
        !self.marker(stage).swap(true, Ordering::AcqRel)
    }

    pub fn is_delivered(&self, stage: DeliveryStage) -> bool {
        self.marker(stage).load(Ordering::Acquire)
    }

    /// Whether pre-consensus handling has seen this instance. Consensus
    /// handling must tolerate `false` here (e.g. after a restart).
    pub fn was_pre_handled(&self) -> bool {
        self.is_delivered(DeliveryStage::PreConsensus)
    }

    fn marker(&self, stage: DeliveryStage) -> &AtomicBool {
        match stage {
            DeliveryStage::PreConsensus => &self.pre_consensus_delivered,
            DeliveryStage::Consensus => &self.consensus_delivered,
        }
    }
}
