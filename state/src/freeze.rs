//! Freeze-time detection.

use parking_lot::Mutex;
use tracing::info;

use strata_types::Timestamp;

use crate::dual_state::is_in_freeze_period;
use crate::DualState;

/// Outcome of checking one round against the freeze time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreezeCheck {
    /// The round is before the freeze time, or no freeze is scheduled.
    Outside,
    /// This round is the first to reach the freeze time.
    Crossed { freeze_time: Timestamp },
    /// A previous round already crossed it.
    AlreadyFrozen { freeze_round: u64 },
}

impl FreezeCheck {
    pub fn is_crossed(&self) -> bool {
        matches!(self, Self::Crossed { .. })
    }
}

#[derive(Debug, Default)]
struct FreezeInner {
    freeze_time: Option<Timestamp>,
    freeze_round: Option<u64>,
}

/// Detects the first round whose consensus timestamp reaches the freeze time.
///
/// The freeze time recorded in the consensus [`DualState`] wins over the one
/// configured here, so a freeze scheduled through the state (by a system
/// transaction, say) takes effect without touching the controller. The
/// controller only detects and flags; halting round consumption is the
/// owner's job.
#[derive(Debug, Default)]
pub struct FreezeController {
    inner: Mutex<FreezeInner>,
}

impl FreezeController {
    pub fn new(freeze_time: Option<Timestamp>) -> Self {
        Self {
            inner: Mutex::new(FreezeInner {
                freeze_time,
                freeze_round: None,
            }),
        }
    }

    pub fn freeze_time(&self) -> Option<Timestamp> {
        self.inner.lock().freeze_time
    }

    pub fn set_freeze_time(&self, freeze_time: Option<Timestamp>) {
        self.inner.lock().freeze_time = freeze_time;
    }

    /// The round that crossed the freeze time, once one has.
    pub fn freeze_round(&self) -> Option<u64> {
        self.inner.lock().freeze_round
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze_round().is_some()
    }

    /// Forget the freeze round, e.g. after the state was replaced.
    pub fn reset(&self) {
        self.inner.lock().freeze_round = None;
    }

    /// Compare a round's consensus timestamp with the effective freeze time.
    /// Only the first crossing is reported as [`FreezeCheck::Crossed`].
    pub fn check_and_mark(&self, round: u64, consensus_timestamp: Timestamp, dual: &DualState) -> FreezeCheck {
        let mut inner = self.inner.lock();
        if let Some(freeze_round) = inner.freeze_round {
            return FreezeCheck::AlreadyFrozen { freeze_round };
        }
        let effective = dual.freeze_time().or(inner.freeze_time);
        if !is_in_freeze_period(consensus_timestamp, effective, dual.last_frozen_time()) {
            return FreezeCheck::Outside;
        }
        let Some(freeze_time) = effective else {
            return FreezeCheck::Outside;
        };
        inner.freeze_round = Some(round);
        info!(round, %freeze_time, %consensus_timestamp, "freeze time reached");
        FreezeCheck::Crossed { freeze_time }
    }
}
