//! Which rounds get a signed state.

/// Frequency-based snapshot policy.
///
/// Round 1 and the freeze round are always signed. Otherwise a round is
/// signed when it is a multiple of the frequency; a frequency below 1
/// disables periodic signing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignedStatePolicy {
    frequency: i64,
}

impl SignedStatePolicy {
    pub fn new(frequency: i64) -> Self {
        Self { frequency }
    }

    pub fn frequency(&self) -> i64 {
        self.frequency
    }

    pub fn should_sign(&self, round: u64, is_freeze_round: bool) -> bool {
        if round == 1 || is_freeze_round {
            return true;
        }
        match u64::try_from(self.frequency) {
            Ok(freq) if freq >= 1 => round % freq == 0,
            _ => false,
        }
    }
}

impl Default for SignedStatePolicy {
    fn default() -> Self {
        Self::new(1)
    }
}
