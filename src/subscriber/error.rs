use thiserror::Error;

use crate::{batch::error::BatchError, types::LogConversionError};

#[derive(Error, Debug)]
pub enum SubscriberError {
    #[error(transparent)]
    BatchError(#[from] BatchError),
    #[error(transparent)]
    SolTypesError(#[from] alloy::sol_types::Error),
    #[error(transparent)]
    LogConversionError(#[from] LogConversionError),
    #[error("{name}: generated state for block {block_number} is invalid")]
    InvalidGeneratedState { name: String, block_number: u64 },
    #[error("Expected {expected} return values, got {actual}")]
    UnexpectedOutputCount { expected: usize, actual: usize },
}
