use thiserror::Error;

use super::cache::CacheError;
use crate::{amms::error::AMMError, batch::error::BatchError};

#[derive(Error, Debug)]
pub enum PollingError {
    #[error(transparent)]
    BatchError(#[from] BatchError),
    #[error(transparent)]
    CacheError(#[from] CacheError),
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),
    #[error(transparent)]
    AMMError(#[from] AMMError),
    #[error("{manager}: pool {identifier} is already registered as a {registry} pool")]
    AlreadyRegistered {
        manager: String,
        identifier: String,
        registry: &'static str,
    },
    #[error("Pool {identifier}: {failed} of {total} state calls failed")]
    FailedCalls {
        identifier: String,
        failed: usize,
        total: usize,
    },
    #[error("Pool {identifier}: base pool state is not available")]
    MissingBaseState { identifier: String },
    #[error("Pool {identifier}: expected {expected} results, got {actual}")]
    UnexpectedResultCount {
        identifier: String,
        expected: usize,
        actual: usize,
    },
    #[error("Some liquidity API requests failed")]
    LiquidityUnavailable,
}
