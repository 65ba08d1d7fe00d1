//! Gossiped events and the consensus data the ordering collaborator assigns.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::{EventId, NodeId, Timestamp, Transaction, TransactionId, TypesError};

/// Position of an event in the total order, assigned exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusData {
    /// The round in which the event reached consensus.
    pub round_received: u64,
    /// Global consensus order index.
    pub consensus_order: u64,
    /// Consensus timestamp of the event's first transaction.
    pub consensus_timestamp: Timestamp,
}

/// An immutable unit of gossip: one creator's ordered batch of transactions.
#[derive(Debug, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    created_at: Timestamp,
    transactions: Vec<Transaction>,
    #[serde(skip)]
    consensus: OnceLock<ConsensusData>,
}

impl Event {
    pub fn new(id: EventId, created_at: Timestamp, transactions: Vec<Transaction>) -> Self {
        Self {
            id,
            created_at,
            transactions,
            consensus: OnceLock::new(),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn creator(&self) -> NodeId {
        self.id.creator
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Iterate transactions together with their identifiers, in event order.
    pub fn transactions_with_ids(&self) -> impl Iterator<Item = (TransactionId, &Transaction)> {
        let event = self.id;
        self.transactions.iter().enumerate().map(move |(i, tx)| {
            (
                TransactionId {
                    event,
                    index: i as u32,
                },
                tx,
            )
        })
    }

    /// Assign consensus data. Fails if it was already assigned; consensus
    /// order and timestamp never change once set.
    pub fn assign_consensus(&self, data: ConsensusData) -> Result<(), TypesError> {
        self.consensus
            .set(data)
            .map_err(|_| TypesError::ConsensusAlreadyAssigned(self.id))
    }

    pub fn consensus(&self) -> Option<&ConsensusData> {
        self.consensus.get()
    }

    pub fn is_consensus(&self) -> bool {
        self.consensus.get().is_some()
    }

    pub fn consensus_order(&self) -> Option<u64> {
        self.consensus.get().map(|c| c.consensus_order)
    }

    /// Consensus time of the transaction at `index`, if the event is consensus.
    pub fn consensus_time(&self, index: usize) -> Option<Timestamp> {
        self.consensus
            .get()
            .map(|c| c.consensus_timestamp.plus_nanos(index as u64))
    }

    /// Best guess of the consensus time of the transaction at `index`, used
    /// before the real time is known.
    pub fn estimated_time(&self, index: usize) -> Timestamp {
        self.consensus_time(index)
            .unwrap_or_else(|| self.created_at.plus_nanos(index as u64))
    }

    /// Consensus time of the last transaction (or the event itself when empty).
    pub fn last_transaction_time(&self) -> Option<Timestamp> {
        self.consensus_time(self.transactions.len().saturating_sub(1))
    }
}
