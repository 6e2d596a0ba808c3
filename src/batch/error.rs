use alloy::{primitives::Address, transports::TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    ContractError(#[from] alloy::contract::Error),
    #[error(transparent)]
    SolTypesError(#[from] alloy::sol_types::Error),
    #[error("Multicall returned {returned} results for {requested} calls")]
    LengthMismatch { requested: usize, returned: usize },
    #[error("Call {index} to {target} failed")]
    CallFailed { index: usize, target: Address },
    #[error("Empty return data")]
    EmptyReturnData,
}
