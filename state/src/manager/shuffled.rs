use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use strata_types::{ConsensusRound, Event, FailureLog, Timestamp};

use super::{
    apply_round, apply_speculative, clear_freeze, mutate_or_record, pre_handle_event, set_freeze,
    Pending, RoundOutcome, StateManager, StateStrategy, DEFAULT_STALE_AFTER_ROUNDS,
};
use crate::{AppState, DualState, GenerationId, GenerationRef, SignedState, StateArena};

struct ShuffledInner {
    consensus: GenerationRef,
    current: GenerationRef,
    work: GenerationRef,
    /// Events applied to `current` but not yet to `work`.
    work_queue: VecDeque<Pending>,
    /// Events applied to `work` since the last shuffle; replayed onto the
    /// next work generation.
    for_next: Vec<Pending>,
    latest_immutable: Option<GenerationRef>,
    shuffles: u64,
    last_round: u64,
}

/// Single logical state kept as three generations.
///
/// `current` is what pre-consensus events and readers see. `work` trails it,
/// having started as a copy of the consensus generation at the last shuffle.
/// A shuffle promotes `work` to `current` (so speculative effects are
/// re-applied on top of everything that reached consensus since) and starts
/// a new `work` from the consensus generation.
pub struct ShuffledStateManager {
    arena: StateArena,
    failures: Arc<FailureLog>,
    stale_after_rounds: u64,
    inner: Mutex<ShuffledInner>,
}

impl ShuffledStateManager {
    pub fn new(app: AppState, dual: DualState, failures: Arc<FailureLog>) -> Self {
        let arena = StateArena::new();
        let consensus = arena.create(app, dual);
        let current = consensus.duplicate();
        let work = consensus.duplicate();
        Self {
            arena,
            failures,
            stale_after_rounds: DEFAULT_STALE_AFTER_ROUNDS,
            inner: Mutex::new(ShuffledInner {
                consensus,
                current,
                work,
                work_queue: VecDeque::new(),
                for_next: Vec::new(),
                latest_immutable: None,
                shuffles: 0,
                last_round: 0,
            }),
        }
    }

    pub fn with_stale_after_rounds(mut self, rounds: u64) -> Self {
        self.stale_after_rounds = rounds;
        self
    }

    /// Number of shuffles performed so far.
    pub fn shuffles(&self) -> u64 {
        self.inner.lock().shuffles
    }

    fn catch_up_locked(&self, inner: &mut ShuffledInner) -> usize {
        let mut processed = 0;
        while let Some(pending) = inner.work_queue.pop_front() {
            processed += 1;
            let accepted = mutate_or_record(&inner.work, &self.failures, |g| {
                apply_speculative(g, &pending.event, &self.failures)
            })
            .flatten();
            // discarded events are already part of the consensus generation
            if accepted.is_some() {
                inner.for_next.push(pending);
            }
        }
        processed
    }

    fn shuffle_locked(&self, inner: &mut ShuffledInner) -> GenerationId {
        self.catch_up_locked(inner);
        let last = inner.consensus.read().last_consensus_order();
        let (now, window) = (inner.last_round, self.stale_after_rounds);
        let before = inner.for_next.len();
        inner.for_next.retain(|pending| !pending.is_settled(last, now, window));
        let pruned = before - inner.for_next.len();
        if pruned > 0 {
            debug!(round = now, pruned, "pending events settled");
        }
        let next_work = inner.consensus.duplicate();
        let promoted = mem::replace(&mut inner.work, next_work);
        let previous = mem::replace(&mut inner.current, promoted);
        previous.make_immutable();
        inner.work_queue = mem::take(&mut inner.for_next).into();
        inner.shuffles += 1;
        debug!(
            shuffle = inner.shuffles,
            current = %inner.current.id(),
            work = %inner.work.id(),
            replay = inner.work_queue.len(),
            "shuffled"
        );
        inner.current.id()
    }
}

impl StateManager for ShuffledStateManager {
    fn strategy(&self) -> StateStrategy {
        StateStrategy::Shuffled
    }

    fn pre_handle(&self, event: &Event) -> usize {
        let current = self.current_state();
        let handled = pre_handle_event(&current.read(), event, &self.failures);
        handled
    }

    fn apply_pre_consensus(&self, event: &Arc<Event>) -> usize {
        let mut inner = self.inner.lock();
        let applied = mutate_or_record(&inner.current, &self.failures, |g| {
            apply_speculative(g, event, &self.failures)
        })
        .flatten()
        .unwrap_or(0);
        let queued_at = inner.last_round;
        inner.work_queue.push_back(Pending::new(event, queued_at));
        applied
    }

    fn apply_consensus_round(&self, round: &ConsensusRound) -> RoundOutcome {
        let consensus = self.inner.lock().consensus.clone();
        let outcome = mutate_or_record(&consensus, &self.failures, |g| {
            apply_round(g, round, &self.failures)
        })
        .unwrap_or_default();
        let mut inner = self.inner.lock();
        inner.last_round = inner.last_round.max(round.round_number());
        outcome
    }

    fn consensus_dual_state(&self) -> DualState {
        let consensus = self.inner.lock().consensus.clone();
        let dual = consensus.read().dual().clone();
        dual
    }

    fn set_freeze_time(&self, freeze_time: Option<Timestamp>) {
        let inner = self.inner.lock();
        for generation in [&inner.consensus, &inner.current, &inner.work] {
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
        for generation in [&inner.consensus, &inner.current, &inner.work] {
            mutate_or_record(generation, &self.failures, clear_freeze);
        }
    }

    fn state_for_signing(&self) -> GenerationRef {
        let mut inner = self.inner.lock();
        let next = inner.consensus.fast_copy();
        let signed = mem::replace(&mut inner.consensus, next);
        inner.latest_immutable = Some(signed.clone());
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
        self.shuffle_locked(&mut inner)
    }

    fn catch_up(&self) -> usize {
        let mut inner = self.inner.lock();
        self.catch_up_locked(&mut inner)
    }

    fn load_from_signed_state(&self, signed: &SignedState) {
        let mut inner = self.inner.lock();
        inner.consensus = self.arena.copy_from(signed.generation());
        inner.current = inner.consensus.duplicate();
        inner.work = inner.consensus.duplicate();
        inner.work_queue.clear();
        inner.for_next.clear();
        inner.last_round = signed.round();
        inner.latest_immutable = Some(signed.generation().clone());
        debug!(round = signed.round(), generation = %inner.consensus.id(), "loaded signed state");
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.work_queue.clear();
        inner.for_next.clear();
        inner.current = inner.consensus.duplicate();
        inner.work = inner.consensus.duplicate();
    }

    fn pending_speculative(&self) -> usize {
        let inner = self.inner.lock();
        inner.work_queue.len() + inner.for_next.len()
    }

    fn arena(&self) -> &StateArena {
        &self.arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{event, make_consensus, round, Ledger};

    fn manager() -> (ShuffledStateManager, Arc<FailureLog>) {
        let failures = Arc::new(FailureLog::new());
        let manager = ShuffledStateManager::new(
            AppState::transactional(Ledger::default()),
            DualState::new(),
            Arc::clone(&failures),
        );
        (manager, failures)
    }

    fn ledger(generation: &GenerationRef) -> Ledger {
        generation.read().app().downcast_ref::<Ledger>().unwrap().clone()
    }

    #[test]
    fn pre_consensus_lands_on_current_and_queues_for_work() {
        let (manager, _) = manager();
        manager.apply_pre_consensus(&event(1, 1, &[b"a"]));
        assert_eq!(ledger(&manager.current_state()).payloads(), vec![b"a".to_vec()]);
        assert_eq!(manager.pending_speculative(), 1);
        assert_eq!(manager.catch_up(), 1);
        assert_eq!(manager.pending_speculative(), 1);
    }

    #[test]
    fn shuffle_puts_consensus_effects_before_speculative_ones() {
        let (manager, failures) = manager();
        let a = event(1, 1, &[b"a"]);
        let b = event(2, 1, &[b"b"]);
        manager.apply_pre_consensus(&a);
        manager.apply_pre_consensus(&b);
        // b reaches consensus first
        make_consensus(&b, 1, 0);
        manager.apply_consensus_round(&round(1, &[b]));

        manager.refresh_current();
        manager.refresh_current();
        let current = ledger(&manager.current_state());
        assert_eq!(current.payloads(), vec![b"b".to_vec(), b"a".to_vec()]);
        assert_eq!(current.consensus_payloads(), vec![b"b".to_vec()]);
        assert_eq!(manager.shuffles(), 2);
        assert!(failures.is_empty());
    }

    #[test]
    fn shuffle_does_not_lose_speculative_events() {
        let (manager, _) = manager();
        for seq in 0..10u64 {
            let payload = [seq as u8];
            manager.apply_pre_consensus(&event(1, seq, &[&payload]));
            if seq % 3 == 0 {
                manager.refresh_current();
            }
        }
        manager.refresh_current();
        let mut payloads = ledger(&manager.current_state()).payloads();
        payloads.sort();
        assert_eq!(payloads, (0..10u8).map(|b| vec![b]).collect::<Vec<_>>());
    }

    #[test]
    fn consensus_events_leave_the_replay_queue() {
        let (manager, _) = manager();
        let a = event(1, 1, &[b"a"]);
        manager.apply_pre_consensus(&a);
        manager.refresh_current();
        assert_eq!(manager.pending_speculative(), 1);

        make_consensus(&a, 1, 0);
        manager.apply_consensus_round(&round(1, &[a]));
        manager.refresh_current();
        manager.catch_up();
        assert_eq!(manager.pending_speculative(), 0);
    }

    #[test]
    fn replay_queue_stays_bounded_without_consensus() {
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
            manager.refresh_current();
            manager.catch_up();
            assert!(manager.pending_speculative() <= 100, "round {n}");
        }
        assert_eq!(manager.pending_speculative(), 0);

        manager.apply_pre_consensus(&event(7, 500, &[b"young"]));
        manager.refresh_current();
        assert_eq!(manager.pending_speculative(), 1);
        assert_eq!(
            ledger(&manager.current_state()).payloads().last(),
            Some(&b"young".to_vec())
        );
        assert!(failures.is_empty());
    }

    #[test]
    fn superseded_current_is_immutable_for_readers() {
        let (manager, _) = manager();
        let reader = manager.current_state();
        manager.refresh_current();
        assert!(reader.is_immutable());
        assert_ne!(reader.id(), manager.current_mutable());
    }

    #[test]
    fn signing_does_not_disturb_current() {
        let (manager, _) = manager();
        manager.apply_pre_consensus(&event(1, 1, &[b"a"]));
        let current = manager.current_mutable();
        let signed = manager.state_for_signing();
        assert!(signed.is_immutable());
        assert_eq!(manager.current_mutable(), current);
        assert_eq!(manager.latest_immutable().map(|g| g.id()), Some(signed.id()));
    }
}
