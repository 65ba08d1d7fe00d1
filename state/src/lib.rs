//! Versioned application state for the strata pipeline.
//!
//! Generations of the application state live in a reference-counted
//! [`StateArena`]. A [`StateManager`] strategy decides which generation each
//! kind of work mutates, [`SignedStatePolicy`] and [`FreezeController`]
//! decide when an immutable [`SignedState`] is cut, and the application plugs
//! in through one of the two [`AppState`] shapes.

pub mod app;
pub mod arena;
pub mod dual_state;
pub mod error;
pub mod freeze;
pub mod generation;
pub mod manager;
pub mod policy;
pub mod signed_state;

#[cfg(test)]
mod test_support;

pub use app::{
    invoke_guarded, AppError, AppShape, AppState, RoundState, TransactionContext,
    TransactionalState,
};
pub use arena::{GenerationRef, StateArena};
pub use dual_state::DualState;
pub use error::StateError;
pub use freeze::{FreezeCheck, FreezeController};
pub use generation::{Generation, GenerationId};
pub use manager::{
    build_state_manager, DualStateManager, RoundOutcome, ShuffledStateManager, StateManager,
    StateStrategy, DEFAULT_STALE_AFTER_ROUNDS,
};
pub use policy::SignedStatePolicy;
pub use signed_state::SignedState;
