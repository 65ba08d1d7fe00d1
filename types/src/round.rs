//! Consensus rounds delivered by the ordering collaborator.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{ConsensusData, Event, Timestamp, TypesError};

/// Bookkeeping the ordering collaborator attaches to each round. The pipeline
/// forwards it untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinGenerationInfo(pub Vec<(u64, u64)>);

/// A non-empty, ordered batch of consensus events sharing one round number.
#[derive(Clone, Debug)]
pub struct ConsensusRound {
    round: u64,
    events: Vec<Arc<Event>>,
    min_generation_info: MinGenerationInfo,
}

impl ConsensusRound {
    /// Build a round. Events are kept in the order given, which must be the
    /// consensus order. Only emptiness is rejected here; the per-event
    /// consensus data is verified by whoever handles the round.
    pub fn new(
        round: u64,
        events: Vec<Arc<Event>>,
        min_generation_info: MinGenerationInfo,
    ) -> Result<Self, TypesError> {
        if events.is_empty() {
            return Err(TypesError::EmptyRound(round));
        }
        Ok(Self {
            round,
            events,
            min_generation_info,
        })
    }

    pub fn round_number(&self) -> u64 {
        self.round
    }

    pub fn events(&self) -> &[Arc<Event>] {
        &self.events
    }

    pub fn last_event(&self) -> &Arc<Event> {
        // non-empty by construction
        &self.events[self.events.len() - 1]
    }

    /// The round's consensus timestamp: that of the last transaction of its
    /// last event.
    pub fn consensus_timestamp(&self) -> Option<Timestamp> {
        self.last_event().last_transaction_time()
    }

    pub fn transaction_count(&self) -> usize {
        self.events.iter().map(|e| e.transactions().len()).sum()
    }

    pub fn min_generation_info(&self) -> &MinGenerationInfo {
        &self.min_generation_info
    }

    /// Verify that `event` carries consensus data for this round.
    pub fn check_event<'a>(&self, event: &'a Event) -> Result<&'a ConsensusData, TypesError> {
        let data = event
            .consensus()
            .ok_or(TypesError::MissingConsensusData { event: event.id() })?;
        if data.round_received != self.round {
            return Err(TypesError::RoundMismatch {
                event: event.id(),
                expected: self.round,
                actual: data.round_received,
            });
        }
        Ok(data)
    }
}
