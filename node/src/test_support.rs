//! Shared fixtures for unit tests in this crate.

use std::any::Any;
use std::sync::Arc;

use strata_state::{
    build_state_manager, AppError, AppState, DualState, GenerationRef, StateStrategy,
    TransactionContext, TransactionalState, DEFAULT_STALE_AFTER_ROUNDS,
};
use strata_types::{
    ConsensusData, Event, EventId, FailureLog, NodeId, Timestamp, Transaction, TransactionId,
};

use crate::pipeline::PipelineContext;
use crate::{EventBus, SystemTransactionRouter};

/// Application state that appends every payload it is handed.
#[derive(Clone, Debug, Default)]
pub struct Journal {
    pub payloads: Vec<Vec<u8>>,
}

impl TransactionalState for Journal {
    fn pre_handle(&self, _: TransactionId, _: &Transaction) -> Result<(), AppError> {
        Ok(())
    }

    fn handle_transaction(
        &mut self,
        _: &TransactionContext,
        transaction: &Transaction,
        _: &mut DualState,
    ) -> Result<(), AppError> {
        self.payloads.push(transaction.payload().to_vec());
        Ok(())
    }

    fn copy_state(&self) -> Box<dyn TransactionalState> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn context(strategy: StateStrategy) -> PipelineContext {
    let failures = Arc::new(FailureLog::new());
    PipelineContext {
        manager: build_state_manager(
            strategy,
            AppState::transactional(Journal::default()),
            DualState::new(),
            Arc::clone(&failures),
            DEFAULT_STALE_AFTER_ROUNDS,
        ),
        router: Arc::new(SystemTransactionRouter::new()),
        failures,
        metrics: None,
        bus: Arc::new(EventBus::new()),
    }
}

pub fn ledger_payloads(generation: &GenerationRef) -> Vec<Vec<u8>> {
    generation
        .read()
        .app()
        .downcast_ref::<Journal>()
        .map(|journal| journal.payloads.clone())
        .unwrap_or_default()
}

/// An event from node 1 that already reached consensus.
pub fn consensus_event(
    seq: u64,
    round: u64,
    order: u64,
    timestamp: Timestamp,
    payloads: &[&[u8]],
) -> Arc<Event> {
    let transactions = payloads
        .iter()
        .map(|p| Transaction::application(p.to_vec()))
        .collect();
    let event = Event::new(EventId::new(NodeId(1), seq), timestamp, transactions);
    event
        .assign_consensus(ConsensusData {
            round_received: round,
            consensus_order: order,
            consensus_timestamp: timestamp,
        })
        .unwrap();
    Arc::new(event)
}
