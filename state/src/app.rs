//! The application capability the state manager drives.
//!
//! Two shapes are supported and selected at startup by constructing the
//! matching [`AppState`] variant:
//!
//! - [`TransactionalState`] receives every transaction individually, both
//!   speculatively (before consensus) and in consensus order.
//! - [`RoundState`] pre-handles whole events and receives each consensus round
//!   as a unit.
//!
//! The pipeline depends only on [`AppState`]; nothing outside this module
//! matches on the shape.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;

use strata_types::{ConsensusRound, Event, NodeId, Timestamp, Transaction, TransactionId};

use crate::DualState;

/// Error returned by application callbacks.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct AppError(pub String);

impl AppError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Everything the application learns about a transaction when handling it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionContext {
    pub id: TransactionId,
    pub creator: NodeId,
    pub created_at: Timestamp,
    /// The real consensus time when `is_consensus`, an estimate otherwise.
    pub consensus_time: Timestamp,
    pub consensus_order: Option<u64>,
    pub is_consensus: bool,
}

/// Application state that handles transactions one at a time.
pub trait TransactionalState: Send + Sync {
    /// Validate or pre-compute a transaction. Runs once per transaction,
    /// before its consensus position is known, and must not mutate state.
    fn pre_handle(&self, id: TransactionId, transaction: &Transaction) -> Result<(), AppError>;

    /// Apply one transaction. Called speculatively (`is_consensus == false`)
    /// on working generations and exactly once in consensus order on the
    /// consensus generation.
    fn handle_transaction(
        &mut self,
        context: &TransactionContext,
        transaction: &Transaction,
        dual: &mut DualState,
    ) -> Result<(), AppError>;

    /// Produce an independent copy of this state.
    fn copy_state(&self) -> Box<dyn TransactionalState>;

    fn as_any(&self) -> &dyn Any;
}

/// Application state that consumes whole consensus rounds.
pub trait RoundState: Send + Sync {
    /// Pre-handle every transaction of an event. Must not mutate state.
    fn pre_handle(&self, event: &Event) -> Result<(), AppError>;

    fn handle_consensus_round(
        &mut self,
        round: &ConsensusRound,
        dual: &mut DualState,
    ) -> Result<(), AppError>;

    fn copy_state(&self) -> Box<dyn RoundState>;

    fn as_any(&self) -> &dyn Any;
}

/// Which capability shape an [`AppState`] implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppShape {
    Transactional,
    RoundOriented,
}

/// The application state owned by one generation.
pub enum AppState {
    Transactional(Box<dyn TransactionalState>),
    RoundOriented(Box<dyn RoundState>),
}

impl AppState {
    pub fn transactional(state: impl TransactionalState + 'static) -> Self {
        Self::Transactional(Box::new(state))
    }

    pub fn round_oriented(state: impl RoundState + 'static) -> Self {
        Self::RoundOriented(Box::new(state))
    }

    pub fn shape(&self) -> AppShape {
        match self {
            Self::Transactional(_) => AppShape::Transactional,
            Self::RoundOriented(_) => AppShape::RoundOriented,
        }
    }

    pub fn copy(&self) -> Self {
        match self {
            Self::Transactional(state) => Self::Transactional(state.copy_state()),
            Self::RoundOriented(state) => Self::RoundOriented(state.copy_state()),
        }
    }

    /// Borrow the concrete application type, if it is `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        match self {
            Self::Transactional(state) => state.as_any().downcast_ref(),
            Self::RoundOriented(state) => state.as_any().downcast_ref(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AppState").field(&self.shape()).finish()
    }
}

/// Run an application callback, turning a panic into an [`AppError`] so one
/// bad transaction cannot take down the worker driving it.
pub fn invoke_guarded<F>(callback: F) -> Result<(), AppError>
where
    F: FnOnce() -> Result<(), AppError>,
{
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(AppError(format!("application panicked: {message}")))
        }
    }
}
