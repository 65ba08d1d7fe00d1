//! One versioned copy of the application state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{AppState, DualState};

/// Monotonically increasing identifier of a state generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenerationId(pub u64);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

/// Application state plus the platform bookkeeping that travels with it.
///
/// `round` and `last_consensus_order` describe what has been applied to this
/// generation in consensus order; a generation never applies an event whose
/// consensus order is at or below `last_consensus_order`.
#[derive(Debug)]
pub struct Generation {
    id: GenerationId,
    app: AppState,
    dual: DualState,
    round: u64,
    last_consensus_order: Option<u64>,
    immutable: bool,
}

impl Generation {
    pub(crate) fn new(id: GenerationId, app: AppState, dual: DualState) -> Self {
        Self {
            id,
            app,
            dual,
            round: 0,
            last_consensus_order: None,
            immutable: false,
        }
    }

    /// A mutable copy of this generation under a new id.
    pub(crate) fn copy_as(&self, id: GenerationId) -> Self {
        Self {
            id,
            app: self.app.copy(),
            dual: self.dual.clone(),
            round: self.round,
            last_consensus_order: self.last_consensus_order,
            immutable: false,
        }
    }

    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn app(&self) -> &AppState {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut AppState {
        &mut self.app
    }

    pub fn dual(&self) -> &DualState {
        &self.dual
    }

    pub fn dual_mut(&mut self) -> &mut DualState {
        &mut self.dual
    }

    /// Split borrow used when the application mutates both at once.
    pub fn app_and_dual_mut(&mut self) -> (&mut AppState, &mut DualState) {
        (&mut self.app, &mut self.dual)
    }

    /// Last round applied in consensus order, 0 before the first.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn set_round(&mut self, round: u64) {
        self.round = round;
    }

    pub fn last_consensus_order(&self) -> Option<u64> {
        self.last_consensus_order
    }

    /// Decide whether an event should be applied to this generation, and
    /// advance `last_consensus_order` when a consensus event is accepted.
    ///
    /// Non-consensus events are always accepted. A consensus event is
    /// discarded when its order is not beyond the last one applied.
    pub fn accept_event(&mut self, consensus_order: Option<u64>) -> bool {
        let Some(order) = consensus_order else {
            return true;
        };
        if matches!(self.last_consensus_order, Some(last) if order <= last) {
            return false;
        }
        self.last_consensus_order = Some(order);
        true
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    pub(crate) fn mark_immutable(&mut self) {
        self.immutable = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Ledger;

    fn generation() -> Generation {
        Generation::new(GenerationId(1), AppState::transactional(Ledger::default()), DualState::new())
    }

    #[test]
    fn non_consensus_events_are_always_accepted() {
        let mut generation = generation();
        assert!(generation.accept_event(Some(5)));
        assert!(generation.accept_event(None));
        assert_eq!(generation.last_consensus_order(), Some(5));
    }

    #[test]
    fn stale_consensus_events_are_discarded() {
        let mut generation = generation();
        assert!(generation.accept_event(Some(3)));
        assert!(!generation.accept_event(Some(3)));
        assert!(!generation.accept_event(Some(2)));
        assert!(generation.accept_event(Some(4)));
    }

    #[test]
    fn copy_is_mutable_and_keeps_progress() {
        let mut generation = generation();
        generation.accept_event(Some(9));
        generation.set_round(4);
        generation.mark_immutable();

        let copy = generation.copy_as(GenerationId(2));
        assert_eq!(copy.id(), GenerationId(2));
        assert!(!copy.is_immutable());
        assert_eq!(copy.round(), 4);
        assert_eq!(copy.last_consensus_order(), Some(9));
    }
}
