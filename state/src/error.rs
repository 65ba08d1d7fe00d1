use thiserror::Error;

use crate::GenerationId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal mutation of frozen state generation {generation}")]
    IllegalMutation { generation: GenerationId },
}
