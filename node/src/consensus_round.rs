//! Consensus round handling: ordered application, freeze detection and
//! signed-state creation.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use strata_state::{FreezeCheck, FreezeController, RoundOutcome, SignedState, SignedStatePolicy};
use strata_types::{ConsensusRound, FailureKind, Timestamp, TypesError};

use crate::pipeline::PipelineContext;
use crate::tracing_spans::{round_span, signed_state_span};
use crate::work_queue::{Queued, WorkQueue};
use crate::{NodeError, PipelineEvent, StatePersistence, TransactionPool};

const COMPONENT: &str = "consensus-round-handler";

/// What handling one round produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundReport {
    pub outcome: RoundOutcome,
    pub system_transactions: usize,
    pub signed: bool,
    pub freeze: bool,
}

/// Consumes rounds strictly in round-number order and applies every
/// transaction to the consensus state exactly once. After each round it
/// consults the freeze controller and the signed-state policy and, when
/// either asks for it, hands an immutable snapshot to persistence.
pub struct ConsensusRoundHandler {
    queue: WorkQueue<ConsensusRound>,
    context: PipelineContext,
    policy: SignedStatePolicy,
    freeze: Arc<FreezeController>,
    pool: Arc<TransactionPool>,
    persistence: Arc<dyn StatePersistence>,
    last_round: Mutex<Option<u64>>,
    /// Consensus time of the latest round that had one.
    last_timestamp: Mutex<Option<Timestamp>>,
}

impl ConsensusRoundHandler {
    pub fn new(
        capacity: usize,
        context: PipelineContext,
        policy: SignedStatePolicy,
        freeze: Arc<FreezeController>,
        pool: Arc<TransactionPool>,
        persistence: Arc<dyn StatePersistence>,
    ) -> (Self, mpsc::Receiver<Queued<ConsensusRound>>) {
        let (queue, receiver) = WorkQueue::new(capacity);
        (
            Self {
                queue,
                context,
                policy,
                freeze,
                pool,
                persistence,
                last_round: Mutex::new(None),
                last_timestamp: Mutex::new(None),
            },
            receiver,
        )
    }

    /// Queue a round, waiting while the queue is full.
    pub async fn enqueue(&self, round: ConsensusRound) -> Result<(), NodeError> {
        self.queue.push(round).await?;
        self.update_gauge();
        Ok(())
    }

    /// Rounds queued or being handled.
    pub fn queue_size(&self) -> usize {
        self.queue.depth()
    }

    pub fn clear(&self) {
        self.queue.clear();
    }

    pub fn last_round(&self) -> Option<u64> {
        *self.last_round.lock()
    }

    /// Resume after `round`, e.g. once a signed state has been loaded.
    pub fn set_last_round(&self, round: Option<u64>) {
        *self.last_round.lock() = round;
    }

    /// Resume after the round of a loaded signed state, carrying its
    /// consensus time forward.
    pub fn resume_after(&self, signed: &SignedState) {
        self.set_last_round(Some(signed.round()));
        *self.last_timestamp.lock() = Some(signed.consensus_timestamp());
    }

    /// Handle one round synchronously. Returns `None` when the round was
    /// rejected as out of order.
    pub fn handle(&self, round: &ConsensusRound) -> Option<RoundReport> {
        let started = Instant::now();
        let number = round.round_number();
        let _span = round_span(number).entered();
        let ctx = &self.context;

        let expected = self.last_round().map(|last| last + 1);
        if let Some(expected) = expected.filter(|&expected| expected != number) {
            warn!(expected, received = number, "out of order round");
            ctx.failures.record(
                COMPONENT,
                FailureKind::OutOfOrderRound,
                format!("received round {number}, expected {expected}"),
            );
            return None;
        }

        let valid: Vec<_> = round
            .events()
            .iter()
            .filter(|event| match round.check_event(event) {
                Ok(_) => true,
                Err(err) => {
                    let kind = match err {
                        TypesError::RoundMismatch { .. } => FailureKind::OutOfOrderRound,
                        _ => FailureKind::MissingConsensusData,
                    };
                    ctx.failures.record(COMPONENT, kind, err.to_string());
                    false
                }
            })
            .cloned()
            .collect();
        *self.last_round.lock() = Some(number);

        let (outcome, system_transactions, timestamp) =
            match ConsensusRound::new(number, valid, round.min_generation_info().clone()) {
                Ok(usable) => {
                    let outcome = ctx.manager.apply_consensus_round(&usable);
                    let system_transactions =
                        ctx.router.dispatch_post_consensus(&usable, &ctx.failures);
                    (outcome, system_transactions, usable.consensus_timestamp())
                }
                Err(_) => {
                    warn!(round = number, "no usable events in round, consensus state unchanged");
                    (RoundOutcome::default(), 0, None)
                }
            };
        let timestamp = {
            let mut last = self.last_timestamp.lock();
            if timestamp.is_some() {
                *last = timestamp;
            }
            *last
        };

        let mut report = RoundReport {
            outcome,
            system_transactions,
            signed: false,
            freeze: false,
        };
        // a round with no usable events keeps the previous consensus time
        if let Some(timestamp) = timestamp {
            let dual = ctx.manager.consensus_dual_state();
            let check = self.freeze.check_and_mark(number, timestamp, &dual);
            if let FreezeCheck::Crossed { freeze_time } = check {
                report.freeze = true;
                if dual.freeze_time().is_none() {
                    // configured freeze: record it on the state so the snapshot carries it
                    ctx.manager.set_freeze_time(Some(freeze_time));
                }
                self.pool.set_frozen(true);
                ctx.bus.emit(&PipelineEvent::FreezeReached {
                    round: number,
                    freeze_time,
                });
            }
        }
        if self.policy.should_sign(number, report.freeze) {
            // no consensus time seen yet: the snapshot is dated at the epoch
            let timestamp = timestamp.unwrap_or_else(|| Timestamp::from_nanos(0));
            self.sign(round, timestamp, report.freeze);
            report.signed = true;
        }

        if let Some(metrics) = &ctx.metrics {
            metrics.rounds_handled.inc();
            metrics
                .consensus_transactions
                .inc_by((outcome.transactions_applied + system_transactions) as u64);
            metrics
                .round_handle_time_ms
                .observe(started.elapsed().as_secs_f64() * 1_000.0);
        }
        debug!(
            events = outcome.events_applied,
            discarded = outcome.events_discarded,
            transactions = outcome.transactions_applied,
            system_transactions,
            "round handled"
        );
        Some(report)
    }

    fn sign(&self, round: &ConsensusRound, timestamp: Timestamp, freeze: bool) {
        let number = round.round_number();
        let _span = signed_state_span(number, freeze).entered();
        let ctx = &self.context;
        if freeze {
            ctx.manager.mark_frozen();
        }
        let generation = ctx.manager.state_for_signing();
        let generation_id = generation.id();
        let signed = SignedState::new(
            generation,
            number,
            freeze,
            timestamp,
            round.min_generation_info().clone(),
        );
        if freeze {
            info!(round = number, generation = %generation_id, "freeze state created");
        } else {
            debug!(round = number, generation = %generation_id, "signed state created");
        }
        if let Some(metrics) = &ctx.metrics {
            metrics.signed_states.inc();
        }
        ctx.bus.emit(&PipelineEvent::SignedStateCreated {
            round: number,
            generation: generation_id,
            freeze,
        });
        self.persistence.accept(signed);
    }

    /// Run the worker loop until shutdown or until every sender is gone.
    /// A round already dequeued when shutdown arrives is finished first.
    pub fn spawn(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<Queued<ConsensusRound>>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let queued = tokio::select! {
                    biased;
                    _ = shutdown.recv() => {
                        debug!("consensus worker shutting down");
                        break;
                    }
                    queued = receiver.recv() => match queued {
                        Some(queued) => queued,
                        None => break,
                    },
                };
                let Some(round) = self.queue.accept(queued) else {
                    trace!("skipping cleared round");
                    continue;
                };
                let number = round.round_number();
                let handler = Arc::clone(&self);
                let handled = tokio::task::spawn_blocking(move || handler.handle(&round)).await;
                if let Err(err) = handled {
                    error!(round = number, %err, "round handling aborted");
                }
                self.queue.done();
                self.update_gauge();
            }
        })
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.context.metrics {
            metrics.consensus_queue_size.set(self.queue.depth() as i64);
        }
    }
}
