//! Platform-owned fields that live alongside the application state.

use serde::{Deserialize, Serialize};

use strata_types::Timestamp;

/// Freeze bookkeeping carried by every state generation.
///
/// A timestamp is in the freeze period when a freeze time is set, the
/// timestamp has reached it, and that freeze has not already completed
/// (`last_frozen_time` is older than the freeze time).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualState {
    freeze_time: Option<Timestamp>,
    last_frozen_time: Option<Timestamp>,
}

impl DualState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn freeze_time(&self) -> Option<Timestamp> {
        self.freeze_time
    }

    pub fn set_freeze_time(&mut self, freeze_time: Option<Timestamp>) {
        self.freeze_time = freeze_time;
    }

    pub fn last_frozen_time(&self) -> Option<Timestamp> {
        self.last_frozen_time
    }

    /// Record the current freeze as completed.
    pub fn set_last_frozen_to_current_freeze_time(&mut self) {
        self.last_frozen_time = self.freeze_time;
    }

    pub fn is_in_freeze_period(&self, timestamp: Timestamp) -> bool {
        is_in_freeze_period(timestamp, self.freeze_time, self.last_frozen_time)
    }
}

/// Freeze-period test shared by [`DualState`] and the freeze controller.
pub fn is_in_freeze_period(
    timestamp: Timestamp,
    freeze_time: Option<Timestamp>,
    last_frozen_time: Option<Timestamp>,
) -> bool {
    match freeze_time {
        None => false,
        Some(freeze) => {
            timestamp >= freeze && last_frozen_time.map_or(true, |last| last < freeze)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_freeze_time_is_never_frozen() {
        let dual = DualState::new();
        assert!(!dual.is_in_freeze_period(Timestamp::from_nanos(u64::MAX)));
    }

    #[test]
    fn reaching_freeze_time_enters_period() {
        let mut dual = DualState::new();
        dual.set_freeze_time(Some(Timestamp::from_secs(100)));
        assert!(!dual.is_in_freeze_period(Timestamp::from_secs(99)));
        assert!(dual.is_in_freeze_period(Timestamp::from_secs(100)));
        assert!(dual.is_in_freeze_period(Timestamp::from_secs(101)));
    }

    #[test]
    fn completed_freeze_does_not_retrigger() {
        let mut dual = DualState::new();
        dual.set_freeze_time(Some(Timestamp::from_secs(100)));
        dual.set_last_frozen_to_current_freeze_time();
        assert!(!dual.is_in_freeze_period(Timestamp::from_secs(150)));

        // a later freeze is honoured again
        dual.set_freeze_time(Some(Timestamp::from_secs(200)));
        assert!(dual.is_in_freeze_period(Timestamp::from_secs(200)));
    }
}
