//! Immutable snapshots handed to the persistence collaborator.

use strata_types::{MinGenerationInfo, Timestamp};

use crate::{GenerationId, GenerationRef};

/// An immutable generation tagged with the round it was taken after.
///
/// This is the only state object visible outside the pipeline. Cloning a
/// signed state reserves its generation; the collaborator calls
/// [`SignedState::release`] (or drops it) once signing and persistence are
/// done.
#[derive(Clone, Debug)]
pub struct SignedState {
    generation: GenerationRef,
    round: u64,
    freeze: bool,
    consensus_timestamp: Timestamp,
    min_generation_info: MinGenerationInfo,
}

impl SignedState {
    pub fn new(
        generation: GenerationRef,
        round: u64,
        freeze: bool,
        consensus_timestamp: Timestamp,
        min_generation_info: MinGenerationInfo,
    ) -> Self {
        Self {
            generation,
            round,
            freeze,
            consensus_timestamp,
            min_generation_info,
        }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Whether this is the snapshot of the round that crossed the freeze time.
    pub fn is_freeze_state(&self) -> bool {
        self.freeze
    }

    pub fn consensus_timestamp(&self) -> Timestamp {
        self.consensus_timestamp
    }

    pub fn min_generation_info(&self) -> &MinGenerationInfo {
        &self.min_generation_info
    }

    pub fn generation_id(&self) -> GenerationId {
        self.generation.id()
    }

    /// The underlying generation, for read access.
    pub fn generation(&self) -> &GenerationRef {
        &self.generation
    }

    /// Outstanding reservations on the underlying generation.
    pub fn reference_count(&self) -> usize {
        self.generation.arena().ref_count(self.generation.id())
    }

    /// Give up this reservation.
    pub fn release(self) {
        drop(self);
    }
}
