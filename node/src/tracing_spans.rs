//! Pre-built [`tracing::Span`] constructors for pipeline operations.
//!
//! Consistent span names and fields make it easy to filter and correlate
//! one round or one event across the handlers and the state manager.

use tracing::{debug_span, info_span, Span};

use strata_types::NodeId;

/// Span covering the handling of one consensus round.
pub fn round_span(round: u64) -> Span {
    info_span!("round", round)
}

/// Span covering pre-consensus handling of one event.
pub fn event_span(creator: NodeId, sequence: u64) -> Span {
    debug_span!("event", creator = %creator, sequence)
}

/// Span covering one shuffle of the single-state strategy.
pub fn shuffle_span(shuffle: u64) -> Span {
    debug_span!("shuffle", shuffle)
}

/// Span covering the creation of a signed state.
pub fn signed_state_span(round: u64, freeze: bool) -> Span {
    info_span!("signed_state", round, freeze)
}
