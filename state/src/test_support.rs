//! Shared fixtures for unit tests in this crate.

use std::any::Any;
use std::sync::Arc;

use strata_types::{
    ConsensusData, ConsensusRound, Event, EventId, MinGenerationInfo, NodeId, Timestamp,
    Transaction, TransactionId,
};

use crate::{AppError, DualState, RoundState, TransactionContext, TransactionalState};

/// One transaction as the application saw it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub payload: Vec<u8>,
    pub consensus: bool,
}

/// Append-only application state. Payload `b"panic"` panics and `b"reject"`
/// returns an error.
#[derive(Clone, Debug, Default)]
pub struct Ledger {
    pub entries: Vec<Entry>,
}

impl Ledger {
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|e| e.payload.clone()).collect()
    }

    pub fn consensus_payloads(&self) -> Vec<Vec<u8>> {
        self.entries
            .iter()
            .filter(|e| e.consensus)
            .map(|e| e.payload.clone())
            .collect()
    }
}

impl TransactionalState for Ledger {
    fn pre_handle(&self, _: TransactionId, transaction: &Transaction) -> Result<(), AppError> {
        if transaction.payload() == b"reject" {
            return Err(AppError::new("rejected in pre-handle"));
        }
        Ok(())
    }

    fn handle_transaction(
        &mut self,
        context: &TransactionContext,
        transaction: &Transaction,
        _: &mut DualState,
    ) -> Result<(), AppError> {
        match transaction.payload() {
            b"panic" => panic!("ledger cannot handle this"),
            b"reject" => Err(AppError::new("rejected")),
            payload => {
                self.entries.push(Entry {
                    payload: payload.to_vec(),
                    consensus: context.is_consensus,
                });
                Ok(())
            }
        }
    }

    fn copy_state(&self) -> Box<dyn TransactionalState> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Round-oriented state that records round numbers and payloads.
#[derive(Clone, Debug, Default)]
pub struct RoundLog {
    pub rounds: Vec<u64>,
    pub payloads: Vec<Vec<u8>>,
}

impl RoundState for RoundLog {
    fn pre_handle(&self, _: &Event) -> Result<(), AppError> {
        Ok(())
    }

    fn handle_consensus_round(&mut self, round: &ConsensusRound, _: &mut DualState) -> Result<(), AppError> {
        self.rounds.push(round.round_number());
        for event in round.events() {
            for tx in event.transactions() {
                self.payloads.push(tx.payload().to_vec());
            }
        }
        Ok(())
    }

    fn copy_state(&self) -> Box<dyn RoundState> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn event(creator: u64, sequence: u64, payloads: &[&[u8]]) -> Arc<Event> {
    let txs = payloads.iter().map(|p| Transaction::application(p.to_vec())).collect();
    Arc::new(Event::new(
        EventId::new(NodeId(creator), sequence),
        Timestamp::from_secs(sequence),
        txs,
    ))
}

pub fn make_consensus(event: &Event, round: u64, order: u64) {
    event
        .assign_consensus(ConsensusData {
            round_received: round,
            consensus_order: order,
            consensus_timestamp: Timestamp::from_secs(1_000 + order),
        })
        .expect("consensus assigned once");
}

pub fn round(number: u64, events: &[Arc<Event>]) -> ConsensusRound {
    ConsensusRound::new(number, events.to_vec(), MinGenerationInfo::default()).expect("non-empty round")
}
