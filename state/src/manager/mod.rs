//! The State Manager: owner of the versioned application state.
//!
//! Two strategies implement [`StateManager`]:
//!
//! - [`DualStateManager`] keeps an authoritative consensus generation and an
//!   independent current generation fed by pre-consensus events, and rebuilds
//!   the current one from the consensus one whenever a signed state is taken.
//! - [`ShuffledStateManager`] keeps a consensus, a current and a work
//!   generation. Pre-consensus events hit the current generation right away
//!   and the work generation in the background; a periodic shuffle promotes
//!   work to current and restarts work from a copy of consensus.
//!
//! In both, consensus rounds mutate only the consensus generation, and signed
//! states are immutable copies of it.
//!
//! Lock order: the manager's inner mutex, then a generation lock. Nothing
//! takes the inner mutex while holding a generation lock.

mod dual;
mod shuffled;

pub use dual::DualStateManager;
pub use shuffled::ShuffledStateManager;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use strata_types::{
    ConsensusRound, DeliveryStage, Event, FailureKind, FailureLog, Timestamp,
};

use crate::app::invoke_guarded;
use crate::{
    AppState, DualState, Generation, GenerationId, GenerationRef, SignedState, StateArena,
    StateError, TransactionContext,
};

pub(crate) const COMPONENT: &str = "state-manager";

/// Consensus rounds a speculative event may wait for its own consensus
/// before it is no longer replayed.
pub const DEFAULT_STALE_AFTER_ROUNDS: u64 = 26;

/// Which State Manager strategy a node runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateStrategy {
    #[default]
    Dual,
    Shuffled,
}

impl std::fmt::Display for StateStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dual => f.write_str("dual"),
            Self::Shuffled => f.write_str("shuffled"),
        }
    }
}

/// What applying one consensus round did to the consensus generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    pub round: u64,
    pub events_applied: usize,
    /// Events skipped because their consensus order was already applied or
    /// their consensus data was missing.
    pub events_discarded: usize,
    pub transactions_applied: usize,
}

/// Contract shared by both state strategies.
pub trait StateManager: Send + Sync {
    fn strategy(&self) -> StateStrategy;

    /// Pre-handle every application transaction of `event` exactly once and
    /// return how many were pre-handled. Never mutates state.
    fn pre_handle(&self, event: &Event) -> usize;

    /// Apply `event` speculatively to the current generation. Returns the
    /// number of transactions applied.
    fn apply_pre_consensus(&self, event: &Arc<Event>) -> usize;

    /// Apply a round to the consensus generation, in order, exactly once.
    fn apply_consensus_round(&self, round: &ConsensusRound) -> RoundOutcome;

    /// Freeze bookkeeping of the consensus generation.
    fn consensus_dual_state(&self) -> DualState;

    /// Schedule (or cancel) a freeze on every mutable generation.
    fn set_freeze_time(&self, freeze_time: Option<Timestamp>);

    /// Record on the consensus generation that the scheduled freeze has been
    /// saved.
    fn mark_frozen(&self);

    /// Drop the freeze time, recording it as completed.
    fn clear_freeze_times(&self);

    /// Mark the consensus generation immutable, continue on a fresh copy, and
    /// return the frozen one. It becomes [`StateManager::latest_immutable`].
    fn state_for_signing(&self) -> GenerationRef;

    fn latest_immutable(&self) -> Option<GenerationRef>;

    /// Id of the generation pre-consensus work currently lands on.
    fn current_mutable(&self) -> GenerationId;

    /// Reserve the current generation for reading. The reservation keeps it
    /// alive across shuffles and resyncs.
    fn current_state(&self) -> GenerationRef;

    fn consensus_state(&self) -> GenerationRef;

    /// Give back a reservation obtained from this manager.
    fn release(&self, generation: GenerationRef) {
        drop(generation);
    }

    /// Produce a new current generation (resync or shuffle) and return its id.
    fn refresh_current(&self) -> GenerationId;

    /// Bring background generations up to date; returns events processed.
    fn catch_up(&self) -> usize;

    /// Replace every live generation with copies of a signed state.
    fn load_from_signed_state(&self, signed: &SignedState);

    /// Discard speculative work and rebuild the current generation from the
    /// consensus one.
    fn clear(&self);

    /// Events applied speculatively but not yet known to be in consensus.
    fn pending_speculative(&self) -> usize;

    fn arena(&self) -> &StateArena;
}

/// Build the manager for `strategy` around an initial application state.
/// Speculative events still without consensus after `stale_after_rounds`
/// rounds are dropped from replay.
pub fn build_state_manager(
    strategy: StateStrategy,
    app: AppState,
    dual: DualState,
    failures: Arc<FailureLog>,
    stale_after_rounds: u64,
) -> Arc<dyn StateManager> {
    match strategy {
        StateStrategy::Dual => Arc::new(
            DualStateManager::new(app, dual, failures).with_stale_after_rounds(stale_after_rounds),
        ),
        StateStrategy::Shuffled => Arc::new(
            ShuffledStateManager::new(app, dual, failures)
                .with_stale_after_rounds(stale_after_rounds),
        ),
    }
}

/// A speculatively applied event awaiting replay, with the last consensus
/// round the manager had seen when it arrived.
pub(crate) struct Pending {
    pub(crate) event: Arc<Event>,
    queued_at: u64,
}

impl Pending {
    pub(crate) fn new(event: &Arc<Event>, queued_at: u64) -> Self {
        Self {
            event: Arc::clone(event),
            queued_at,
        }
    }

    /// Whether replay can forget the event: it is already part of the
    /// consensus generation, or it has waited `window` rounds without
    /// reaching consensus.
    pub(crate) fn is_settled(&self, last_order: Option<u64>, round: u64, window: u64) -> bool {
        match self.event.consensus_order() {
            Some(order) => last_order.map_or(false, |last| order <= last),
            None => round.saturating_sub(self.queued_at) >= window,
        }
    }
}

/// Run a mutation, recording an illegal-mutation failure instead of
/// returning it.
pub(crate) fn mutate_or_record<R>(
    generation: &GenerationRef,
    failures: &FailureLog,
    f: impl FnOnce(&mut Generation) -> R,
) -> Option<R> {
    match generation.mutate(f) {
        Ok(result) => Some(result),
        Err(err @ StateError::IllegalMutation { .. }) => {
            warn!(generation = %generation.id(), "{err}");
            failures.record(COMPONENT, FailureKind::IllegalMutation, err.to_string());
            None
        }
    }
}

pub(crate) fn pre_handle_event(generation: &Generation, event: &Event, failures: &FailureLog) -> usize {
    let mut handled = 0;
    match generation.app() {
        AppState::Transactional(app) => {
            for (id, tx) in event.transactions_with_ids() {
                if tx.is_system() {
                    continue;
                }
                if !tx.mark_delivered(DeliveryStage::PreConsensus) {
                    failures.record(
                        COMPONENT,
                        FailureKind::DuplicateDelivery,
                        format!("transaction {id} delivered to pre-handle twice"),
                    );
                    continue;
                }
                handled += 1;
                if let Err(err) = invoke_guarded(|| app.pre_handle(id, tx)) {
                    warn!(transaction = %id, %err, "pre-handle failed");
                    failures.record(COMPONENT, FailureKind::Application, format!("pre-handle {id}: {err}"));
                }
            }
        }
        AppState::RoundOriented(app) => {
            for (id, tx) in event.transactions_with_ids() {
                if tx.is_system() {
                    continue;
                }
                if tx.mark_delivered(DeliveryStage::PreConsensus) {
                    handled += 1;
                } else {
                    failures.record(
                        COMPONENT,
                        FailureKind::DuplicateDelivery,
                        format!("transaction {id} delivered to pre-handle twice"),
                    );
                }
            }
            if handled > 0 {
                if let Err(err) = invoke_guarded(|| app.pre_handle(event)) {
                    warn!(event = %event.id(), %err, "pre-handle failed");
                    failures.record(
                        COMPONENT,
                        FailureKind::Application,
                        format!("pre-handle {}: {err}", event.id()),
                    );
                }
            }
        }
    }
    handled
}

/// Apply one event to a working generation with estimated times.
///
/// Returns `None` when the generation discards the event because its
/// consensus order was already applied. Round-oriented applications have no
/// speculative path, so nothing is applied for them.
pub(crate) fn apply_speculative(
    generation: &mut Generation,
    event: &Event,
    failures: &FailureLog,
) -> Option<usize> {
    if !generation.accept_event(event.consensus_order()) {
        return None;
    }
    let is_consensus = event.is_consensus();
    let (app, dual) = generation.app_and_dual_mut();
    let AppState::Transactional(app) = app else {
        return Some(0);
    };
    let mut applied = 0;
    for (index, (id, tx)) in event.transactions_with_ids().enumerate() {
        if tx.is_system() {
            continue;
        }
        let context = TransactionContext {
            id,
            creator: event.creator(),
            created_at: event.created_at(),
            consensus_time: event.estimated_time(index),
            consensus_order: event.consensus_order(),
            is_consensus,
        };
        match invoke_guarded(|| app.handle_transaction(&context, tx, dual)) {
            Ok(()) => applied += 1,
            Err(err) => {
                warn!(transaction = %id, %err, "speculative transaction failed");
                failures.record(COMPONENT, FailureKind::Application, format!("pre-consensus {id}: {err}"));
            }
        }
    }
    Some(applied)
}

/// Apply a consensus round to the consensus generation.
pub(crate) fn apply_round(
    generation: &mut Generation,
    round: &ConsensusRound,
    failures: &FailureLog,
) -> RoundOutcome {
    let mut outcome = RoundOutcome {
        round: round.round_number(),
        ..RoundOutcome::default()
    };
    let mut admitted: Vec<Arc<Event>> = Vec::with_capacity(round.events().len());

    for event in round.events() {
        let Some(order) = event.consensus_order() else {
            failures.record(
                COMPONENT,
                FailureKind::MissingConsensusData,
                format!("event {} in round {} has no consensus data", event.id(), round.round_number()),
            );
            outcome.events_discarded += 1;
            continue;
        };
        if !generation.accept_event(Some(order)) {
            debug!(event = %event.id(), order, "discarding already applied consensus event");
            outcome.events_discarded += 1;
            continue;
        }
        admitted.push(Arc::clone(event));
    }

    let (app, dual) = generation.app_and_dual_mut();
    match app {
        AppState::Transactional(app) => {
            for event in &admitted {
                for (index, (id, tx)) in event.transactions_with_ids().enumerate() {
                    if tx.is_system() {
                        continue;
                    }
                    if !tx.mark_delivered(DeliveryStage::Consensus) {
                        failures.record(
                            COMPONENT,
                            FailureKind::DuplicateDelivery,
                            format!("transaction {id} delivered to consensus twice"),
                        );
                        continue;
                    }
                    let context = TransactionContext {
                        id,
                        creator: event.creator(),
                        created_at: event.created_at(),
                        consensus_time: event.estimated_time(index),
                        consensus_order: event.consensus_order(),
                        is_consensus: true,
                    };
                    outcome.transactions_applied += 1;
                    if let Err(err) = invoke_guarded(|| app.handle_transaction(&context, tx, dual)) {
                        warn!(transaction = %id, %err, "consensus transaction failed");
                        failures.record(COMPONENT, FailureKind::Application, format!("consensus {id}: {err}"));
                    }
                }
                outcome.events_applied += 1;
            }
        }
        AppState::RoundOriented(app) => {
            let mut deliverable = Vec::with_capacity(admitted.len());
            for event in admitted {
                let duplicate = event
                    .transactions_with_ids()
                    .find(|(_, tx)| !tx.is_system() && tx.is_delivered(DeliveryStage::Consensus));
                if let Some((id, _)) = duplicate {
                    failures.record(
                        COMPONENT,
                        FailureKind::DuplicateDelivery,
                        format!("transaction {id} delivered to consensus twice"),
                    );
                    outcome.events_discarded += 1;
                    continue;
                }
                for tx in event.transactions().iter().filter(|tx| !tx.is_system()) {
                    tx.mark_delivered(DeliveryStage::Consensus);
                    outcome.transactions_applied += 1;
                }
                deliverable.push(event);
            }
            outcome.events_applied = deliverable.len();
            if let Ok(filtered) = ConsensusRound::new(
                round.round_number(),
                deliverable,
                round.min_generation_info().clone(),
            ) {
                if let Err(err) = invoke_guarded(|| app.handle_consensus_round(&filtered, dual)) {
                    warn!(round = round.round_number(), %err, "round handler failed");
                    failures.record(
                        COMPONENT,
                        FailureKind::Application,
                        format!("round {}: {err}", round.round_number()),
                    );
                }
            }
        }
    }

    generation.set_round(round.round_number());
    outcome
}

pub(crate) fn set_freeze(generation: &mut Generation, freeze_time: Option<Timestamp>) {
    generation.dual_mut().set_freeze_time(freeze_time);
}

pub(crate) fn clear_freeze(generation: &mut Generation) {
    let dual = generation.dual_mut();
    dual.set_last_frozen_to_current_freeze_time();
    dual.set_freeze_time(None);
}
