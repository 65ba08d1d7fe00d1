use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use strata_types::{ConsensusRound, Event, FailureLog, Timestamp};

use super::{
    apply_round, apply_speculative, clear_freeze, mutate_or_record, pre_handle_event, set_freeze,
    Pending, RoundOutcome, StateManager, StateStrategy, DEFAULT_STALE_AFTER_ROUNDS,
};
use crate::{AppState, DualState, GenerationId, GenerationRef, SignedState, StateArena};

struct DualInner {
    consensus: GenerationRef,
    current: GenerationRef,
    /// Events applied to `current` that the consensus generation may not
    /// have seen yet, in arrival order.
    pending: VecDeque<Pending>,
    latest_immutable: Option<GenerationRef>,
    last_round: u64,
}

/// Two independent generations: `current` takes pre-consensus events, the
/// consensus generation takes rounds. Every signed state rebuilds `current`
/// from the consensus generation plus the still-pending events.
pub struct DualStateManager {
    arena: StateArena,
    failures: Arc<FailureLog>,
    stale_after_rounds: u64,
    inner: Mutex<DualInner>,
}

impl DualStateManager {
    pub fn new(app: AppState, dual: DualState, failures: Arc<FailureLog>) -> Self {
        let arena = StateArena::new();
        let consensus = arena.create(app, dual);
        let current = consensus.duplicate();
        Self {
            arena,
            failures,
            stale_after_rounds: DEFAULT_STALE_AFTER_ROUNDS,
            inner: Mutex::new(DualInner {
                consensus,
                current,
                pending: VecDeque::new(),
                latest_immutable: None,
                last_round: 0,
            }),
        }
    }

    pub fn with_stale_after_rounds(mut self, rounds: u64) -> Self {
        self.stale_after_rounds = rounds;
        self
    }

    fn resync(&self, inner: &mut DualInner) -> GenerationId {
        let fresh = inner.consensus.duplicate();
        let mut replayed = 0;
        for pending in &inner.pending {
            let applied = mutate_or_record(&fresh, &self.failures, |g| {
                apply_speculative(g, &pending.event, &self.failures)
            })
            .flatten();
            if applied.is_some() {
                replayed += 1;
            }
        }
        let previous = std::mem::replace(&mut inner.current, fresh);
        previous.make_immutable();
        debug!(
            from = %previous.id(),
            to = %inner.current.id(),
            replayed,
            "current state resynced"
        );
        inner.current.id()
    }
}

impl StateManager for DualStateManager {
    fn strategy(&self) -> StateStrategy {
        StateStrategy::Dual
    }

    fn pre_handle(&self, event: &Event) -> usize {
        let current = self.current_state();
        let handled = pre_handle_event(&current.read(), event, &self.failures);
        handled
    }

    fn apply_pre_consensus(&self, event: &Arc<Event>) -> usize {
        let mut inner = self.inner.lock();
        let queued_at = inner.last_round;
        inner.pending.push_back(Pending::new(event, queued_at));
        mutate_or_record(&inner.current, &self.failures, |g| {
            apply_speculative(g, event, &self.failures)
        })
        .flatten()
        .unwrap_or(0)
    }

    fn apply_consensus_round(&self, round: &ConsensusRound) -> RoundOutcome {
        let consensus = self.inner.lock().consensus.clone();
        let outcome = mutate_or_record(&consensus, &self.failures, |g| {
            apply_round(g, round, &self.failures)
        })
        .unwrap_or_default();

        let last = consensus.read().last_consensus_order();
        let mut inner = self.inner.lock();
        inner.last_round = inner.last_round.max(round.round_number());
        let (now, window) = (inner.last_round, self.stale_after_rounds);
        let before = inner.pending.len();
        inner.pending.retain(|pending| !pending.is_settled(last, now, window));
        let pruned = before - inner.pending.len();
        if pruned > 0 {
            debug!(round = now, pruned, "pending events settled");
        }
        outcome
    }

    fn consensus_dual_state(&self) -> DualState {
        let consensus = self.inner.lock().consensus.clone();
        let dual = consensus.read().dual().clone();
        dual
    }

    fn set_freeze_time(&self, freeze_time: Option<Timestamp>) {
        let inner = self.inner.lock();
        for generation in [&inner.consensus, &inner.current] {
            mutate_or_record(generation, &self.failures, |g| set_freeze(g, freeze_time));
        }
    }

    fn mark_frozen(&self) {
        let consensus = self.inner.lock().consensus.clone();
        mutate_or_record(&consensus, &self.failures, |g| {
            g.dual_mut().set_last_frozen_to_current_freeze_time()
        });
    }

    fn clear_freeze_times(&self) {
        let inner = self.inner.lock();
        for generation in [&inner.consensus, &inner.current] {
            mutate_or_record(generation, &self.failures, clear_freeze);
        }
    }

    fn state_for_signing(&self) -> GenerationRef {
        let mut inner = self.inner.lock();
        let next = inner.consensus.fast_copy();
        let signed = std::mem::replace(&mut inner.consensus, next);
        inner.latest_immutable = Some(signed.clone());
        self.resync(&mut inner);
        signed
    }

    fn latest_immutable(&self) -> Option<GenerationRef> {
        self.inner.lock().latest_immutable.clone()
    }

    fn current_mutable(&self) -> GenerationId {
        self.inner.lock().current.id()
    }

    fn current_state(&self) -> GenerationRef {
        self.inner.lock().current.clone()
    }

    fn consensus_state(&self) -> GenerationRef {
        self.inner.lock().consensus.clone()
    }

    fn refresh_current(&self) -> GenerationId {
        let mut inner = self.inner.lock();
        self.resync(&mut inner)
    }

    fn catch_up(&self) -> usize {
        0
    }

    fn load_from_signed_state(&self, signed: &SignedState) {
        let mut inner = self.inner.lock();
        inner.consensus = self.arena.copy_from(signed.generation());
        inner.current = inner.consensus.duplicate();
        inner.pending.clear();
        inner.last_round = signed.round();
        inner.latest_immutable = Some(signed.generation().clone());
        debug!(round = signed.round(), generation = %inner.consensus.id(), "loaded signed state");
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.pending.clear();
        inner.current = inner.consensus.duplicate();
    }

    fn pending_speculative(&self) -> usize {
        self.inner.lock().pending.len()
    }

    fn arena(&self) -> &StateArena {
        &self.arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{event, make_consensus, round, Ledger};
    use strata_types::{FailureKind, MinGenerationInfo};

    fn manager() -> (DualStateManager, Arc<FailureLog>) {
        let failures = Arc::new(FailureLog::new());
        let manager = DualStateManager::new(
            AppState::transactional(Ledger::default()),
            DualState::new(),
            Arc::clone(&failures),
        );
        (manager, failures)
    }

    fn payloads(generation: &GenerationRef) -> Vec<Vec<u8>> {
        generation.read().app().downcast_ref::<Ledger>().unwrap().payloads()
    }

    #[test]
    fn pre_consensus_touches_only_current() {
        let (manager, _) = manager();
        manager.apply_pre_consensus(&event(1, 1, &[b"a"]));
        assert_eq!(payloads(&manager.current_state()), vec![b"a".to_vec()]);
        assert!(payloads(&manager.consensus_state()).is_empty());
        assert_eq!(manager.pending_speculative(), 1);
    }

    #[test]
    fn consensus_round_touches_only_consensus_and_prunes_pending() {
        let (manager, failures) = manager();
        let a = event(1, 1, &[b"a"]);
        manager.apply_pre_consensus(&a);
        make_consensus(&a, 1, 0);
        let outcome = manager.apply_consensus_round(&round(1, &[a]));

        assert_eq!(outcome.transactions_applied, 1);
        assert_eq!(payloads(&manager.consensus_state()), vec![b"a".to_vec()]);
        assert_eq!(manager.pending_speculative(), 0);
        assert!(failures.is_empty());
    }

    #[test]
    fn signing_freezes_consensus_and_resyncs_current() {
        let (manager, failures) = manager();
        let a = event(1, 1, &[b"a"]);
        let b = event(2, 1, &[b"b"]);
        manager.apply_pre_consensus(&a);
        manager.apply_pre_consensus(&b);
        make_consensus(&a, 1, 0);
        manager.apply_consensus_round(&round(1, &[a]));

        let before = manager.current_mutable();
        let signed = manager.state_for_signing();
        assert!(signed.is_immutable());
        assert_eq!(manager.latest_immutable().map(|g| g.id()), Some(signed.id()));
        assert_ne!(manager.consensus_state().id(), signed.id());
        assert_ne!(manager.current_mutable(), before);

        // consensus effects first, then the still-pending event
        assert_eq!(payloads(&manager.current_state()), vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(failures.is_empty());
    }

    #[test]
    fn superseded_generations_are_reclaimed_after_release() {
        let (manager, _) = manager();
        let reader = manager.current_state();
        let signed = manager.state_for_signing();
        manager.release(signed);
        assert!(reader.is_immutable());
        let reader_id = reader.id();
        manager.release(reader);

        let live = manager.arena().live_generations();
        assert!(!live.contains(&reader_id));
        // consensus, current and the latest immutable snapshot
        assert_eq!(live.len(), 3);
    }

    #[test]
    fn freeze_times_follow_the_consensus_generation() {
        let (manager, _) = manager();
        manager.set_freeze_time(Some(Timestamp::from_secs(50)));
        assert_eq!(manager.consensus_dual_state().freeze_time(), Some(Timestamp::from_secs(50)));

        manager.mark_frozen();
        assert_eq!(
            manager.consensus_dual_state().last_frozen_time(),
            Some(Timestamp::from_secs(50))
        );

        manager.clear_freeze_times();
        assert_eq!(manager.consensus_dual_state().freeze_time(), None);
    }

    #[test]
    fn load_from_signed_state_replaces_generations() {
        let (manager, failures) = manager();
        let a = event(1, 1, &[b"a"]);
        make_consensus(&a, 1, 0);
        manager.apply_consensus_round(&round(1, &[a]));
        let signed = SignedState::new(
            manager.state_for_signing(),
            1,
            false,
            Timestamp::from_secs(1),
            MinGenerationInfo::default(),
        );

        let (other, _) = self::manager();
        other.apply_pre_consensus(&event(3, 1, &[b"stale"]));
        other.load_from_signed_state(&signed);
        assert_eq!(payloads(&other.current_state()), vec![b"a".to_vec()]);
        assert_eq!(other.pending_speculative(), 0);
        assert_eq!(failures.count(FailureKind::IllegalMutation), 0);
    }

    #[test]
    fn events_that_never_reach_consensus_are_dropped_from_replay() {
        let (manager, failures) = manager();
        let manager = manager.with_stale_after_rounds(5);
        for seq in 0..100 {
            manager.apply_pre_consensus(&event(7, seq, &[b"orphan"]));
        }
        for n in 1..=50u64 {
            let e = event(1, 1_000 + n, &[b"c"]);
            manager.apply_pre_consensus(&e);
            make_consensus(&e, n, n);
            manager.apply_consensus_round(&round(n, &[e]));
            manager.state_for_signing();
            manager.refresh_current();
            assert!(manager.pending_speculative() <= 100, "round {n}");
        }
        assert_eq!(manager.pending_speculative(), 0);

        // a young orphan survives until its window runs out
        manager.apply_pre_consensus(&event(7, 500, &[b"young"]));
        for n in 51..=54u64 {
            let e = event(1, 1_000 + n, &[b"c"]);
            make_consensus(&e, n, n);
            manager.apply_consensus_round(&round(n, &[e]));
        }
        assert_eq!(manager.pending_speculative(), 1);
        let e = event(1, 1_055, &[b"c"]);
        make_consensus(&e, 55, 55);
        manager.apply_consensus_round(&round(55, &[e]));
        assert_eq!(manager.pending_speculative(), 0);
        assert!(failures.is_empty());
    }

    #[test]
    fn clear_discards_speculative_work() {
        let (manager, _) = manager();
        manager.apply_pre_consensus(&event(1, 1, &[b"a"]));
        manager.clear();
        assert!(payloads(&manager.current_state()).is_empty());
        assert_eq!(manager.pending_speculative(), 0);
    }
}
