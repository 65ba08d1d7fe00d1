//! Errors raised while building or annotating events and rounds.

use thiserror::Error;

use crate::EventId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    #[error("event {0} already has consensus data assigned")]
    ConsensusAlreadyAssigned(EventId),

    #[error("event {event} has no consensus data")]
    MissingConsensusData { event: EventId },

    #[error("consensus round {0} has no events")]
    EmptyRound(u64),

    #[error("event {event} was received in round {actual}, not round {expected}")]
    RoundMismatch {
        event: EventId,
        expected: u64,
        actual: u64,
    },
}
