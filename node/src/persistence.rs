//! Hand-off of signed states to the persistence and signing collaborator.

use tokio::sync::mpsc;
use tracing::warn;

use strata_state::SignedState;

/// Receives every signed state the pipeline produces.
///
/// `accept` runs on the consensus worker and must not block. The
/// collaborator owns the state from here on and releases it when done.
pub trait StatePersistence: Send + Sync {
    fn accept(&self, state: SignedState);
}

impl<F> StatePersistence for F
where
    F: Fn(SignedState) + Send + Sync,
{
    fn accept(&self, state: SignedState) {
        self(state)
    }
}

/// Forwards signed states over an unbounded channel to an async consumer.
pub struct ChannelPersistence {
    tx: mpsc::UnboundedSender<SignedState>,
}

impl ChannelPersistence {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SignedState>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatePersistence for ChannelPersistence {
    fn accept(&self, state: SignedState) {
        if let Err(mpsc::error::SendError(state)) = self.tx.send(state) {
            warn!(round = state.round(), "persistence consumer is gone, releasing signed state");
            state.release();
        }
    }
}

/// Releases every signed state immediately. Used when no collaborator is
/// configured.
pub struct ReleaseImmediately;

impl StatePersistence for ReleaseImmediately {
    fn accept(&self, state: SignedState) {
        state.release();
    }
}
