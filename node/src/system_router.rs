//! Two-stage dispatch of protocol-internal transactions.
//!
//! System transactions never reach the application. They are delivered to
//! the handlers registered for their type, once before consensus (as soon as
//! the carrying event is seen) and once after consensus (in consensus
//! order). Delivery is tracked on the transaction itself, separately from
//! application delivery.

use std::collections::HashMap;

use tracing::warn;

use strata_state::{invoke_guarded, AppError};
use strata_types::{
    ConsensusRound, DeliveryStage, Event, FailureKind, FailureLog, NodeId, SystemTransactionType,
    Timestamp, Transaction, TransactionId,
};

const COMPONENT: &str = "system-router";

/// Dispatch stage of a system transaction handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    PreConsensus,
    PostConsensus,
}

impl Stage {
    fn delivery(self) -> DeliveryStage {
        match self {
            Self::PreConsensus => DeliveryStage::PreConsensus,
            Self::PostConsensus => DeliveryStage::Consensus,
        }
    }
}

/// What a system transaction handler is told about the transaction.
#[derive(Debug)]
pub struct SystemTransactionContext<'a> {
    pub id: TransactionId,
    pub creator: NodeId,
    pub stage: Stage,
    /// Set for post-consensus dispatch only.
    pub consensus_time: Option<Timestamp>,
    pub consensus_order: Option<u64>,
    pub transaction: &'a Transaction,
}

pub type SystemTransactionHandler =
    Box<dyn Fn(&SystemTransactionContext<'_>) -> Result<(), AppError> + Send + Sync>;

/// Registry of system transaction handlers keyed by type and stage.
#[derive(Default)]
pub struct SystemTransactionRouter {
    handlers: HashMap<(SystemTransactionType, Stage), Vec<SystemTransactionHandler>>,
}

impl SystemTransactionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. Several handlers for one type and stage run in
    /// registration order.
    pub fn register(
        &mut self,
        kind: SystemTransactionType,
        stage: Stage,
        handler: impl Fn(&SystemTransactionContext<'_>) -> Result<(), AppError> + Send + Sync + 'static,
    ) {
        self.handlers
            .entry((kind, stage))
            .or_default()
            .push(Box::new(handler));
    }

    pub fn handler_count(&self, kind: SystemTransactionType, stage: Stage) -> usize {
        self.handlers.get(&(kind, stage)).map_or(0, Vec::len)
    }

    /// Deliver the system transactions of a newly seen event. Returns how many
    /// were delivered.
    pub fn dispatch_pre_consensus(&self, event: &Event, failures: &FailureLog) -> usize {
        let mut delivered = 0;
        for (id, tx) in event.transactions_with_ids() {
            if self.deliver(Stage::PreConsensus, event, id, tx, None, failures) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver the system transactions of a consensus round, in consensus
    /// order. Returns how many were delivered.
    pub fn dispatch_post_consensus(&self, round: &ConsensusRound, failures: &FailureLog) -> usize {
        let mut delivered = 0;
        for event in round.events() {
            for (index, (id, tx)) in event.transactions_with_ids().enumerate() {
                let consensus_time = event.consensus_time(index);
                if self.deliver(Stage::PostConsensus, event, id, tx, consensus_time, failures) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn deliver(
        &self,
        stage: Stage,
        event: &Event,
        id: TransactionId,
        tx: &Transaction,
        consensus_time: Option<Timestamp>,
        failures: &FailureLog,
    ) -> bool {
        let Some(kind) = tx.system_type() else {
            return false;
        };
        if !tx.mark_delivered(stage.delivery()) {
            failures.record(
                COMPONENT,
                FailureKind::DuplicateDelivery,
                format!("system transaction {id} ({kind}) delivered to {stage:?} twice"),
            );
            return false;
        }
        let Some(handlers) = self.handlers.get(&(kind, stage)) else {
            return true;
        };
        let context = SystemTransactionContext {
            id,
            creator: event.creator(),
            stage,
            consensus_time,
            consensus_order: event.consensus_order(),
            transaction: tx,
        };
        for handler in handlers {
            if let Err(err) = invoke_guarded(|| handler(&context)) {
                warn!(transaction = %id, %kind, ?stage, %err, "system transaction handler failed");
                failures.record(COMPONENT, FailureKind::Application, format!("{kind} {id}: {err}"));
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use strata_types::{ConsensusData, EventId, MinGenerationInfo};

    fn event_with(txs: Vec<Transaction>) -> Arc<Event> {
        Arc::new(Event::new(EventId::new(NodeId(2), 1), Timestamp::from_secs(1), txs))
    }

    fn counting_router(kind: SystemTransactionType, stage: Stage) -> (SystemTransactionRouter, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut router = SystemTransactionRouter::new();
        router.register(kind, stage, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (router, calls)
    }

    #[test]
    fn application_transactions_are_ignored() {
        let (router, calls) = counting_router(SystemTransactionType::Ping, Stage::PreConsensus);
        let failures = FailureLog::new();
        let event = event_with(vec![
            Transaction::application(vec![1]),
            Transaction::system(SystemTransactionType::Ping, vec![2]),
        ]);
        assert_eq!(router.dispatch_pre_consensus(&event, &failures), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!event.transactions()[0].is_delivered(DeliveryStage::PreConsensus));
    }

    #[test]
    fn second_delivery_to_a_stage_is_a_failure() {
        let (router, calls) = counting_router(SystemTransactionType::Ping, Stage::PreConsensus);
        let failures = FailureLog::new();
        let event = event_with(vec![Transaction::system(SystemTransactionType::Ping, vec![])]);
        router.dispatch_pre_consensus(&event, &failures);
        router.dispatch_pre_consensus(&event, &failures);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failures.count(FailureKind::DuplicateDelivery), 1);
    }

    #[test]
    fn post_consensus_gets_consensus_time_and_order() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut router = SystemTransactionRouter::new();
        router.register(
            SystemTransactionType::StateSignature,
            Stage::PostConsensus,
            move |ctx| {
                sink.lock().push((ctx.consensus_order, ctx.consensus_time));
                Ok(())
            },
        );
        let failures = FailureLog::new();
        let event = event_with(vec![
            Transaction::application(vec![0]),
            Transaction::system(SystemTransactionType::StateSignature, vec![1]),
        ]);
        event
            .assign_consensus(ConsensusData {
                round_received: 1,
                consensus_order: 9,
                consensus_timestamp: Timestamp::from_secs(50),
            })
            .unwrap();
        let round = ConsensusRound::new(1, vec![event], MinGenerationInfo::default()).unwrap();

        assert_eq!(router.dispatch_post_consensus(&round, &failures), 1);
        assert_eq!(
            *seen.lock(),
            vec![(Some(9), Some(Timestamp::from_secs(50).plus_nanos(1)))]
        );
        assert!(failures.is_empty());
    }

    #[test]
    fn failing_handler_is_recorded_and_others_still_run() {
        let (mut router, calls) = counting_router(SystemTransactionType::BitsPerSecond, Stage::PreConsensus);
        router.register(SystemTransactionType::BitsPerSecond, Stage::PreConsensus, |_| {
            panic!("bad report")
        });
        let failures = FailureLog::new();
        let event = event_with(vec![Transaction::system(SystemTransactionType::BitsPerSecond, vec![])]);
        router.dispatch_pre_consensus(&event, &failures);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failures.count(FailureKind::Application), 1);
        assert_eq!(router.handler_count(SystemTransactionType::BitsPerSecond, Stage::PreConsensus), 2);
    }
}
