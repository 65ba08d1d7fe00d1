//! Fundamental types for the strata pipeline.
//!
//! This crate defines the values that flow between gossip, the ordering
//! collaborator and the state pipeline: node, event and transaction
//! identifiers, timestamps, transactions with their delivery markers, events
//! with their once-assigned consensus data, consensus rounds, and the
//! failure log every pipeline component reports into.

pub mod error;
pub mod event;
pub mod failure;
pub mod ids;
pub mod round;
pub mod time;
pub mod transaction;

pub use error::TypesError;
pub use event::{ConsensusData, Event};
pub use failure::{Failure, FailureKind, FailureLog};
pub use ids::{EventId, NodeId, TransactionId};
pub use round::{ConsensusRound, MinGenerationInfo};
pub use time::Timestamp;
pub use transaction::{DeliveryStage, SystemTransactionType, Transaction, TransactionKind};
