//! Decoders for raw multicall return data.

use alloy::{
    primitives::{Address, Bytes, U256},
    sol_types::{SolCall, SolValue},
};

use super::{error::BatchError, MultiResult};

pub fn decode_uint256(data: &[u8]) -> Result<U256, BatchError> {
    non_empty(data)?;
    Ok(U256::abi_decode(data, true)?)
}

pub fn decode_uint256_array(data: &[u8]) -> Result<Vec<U256>, BatchError> {
    non_empty(data)?;
    Ok(Vec::<U256>::abi_decode(data, true)?)
}

pub fn decode_bool(data: &[u8]) -> Result<bool, BatchError> {
    non_empty(data)?;
    Ok(bool::abi_decode(data, true)?)
}

pub fn decode_address(data: &[u8]) -> Result<Address, BatchError> {
    non_empty(data)?;
    Ok(Address::abi_decode(data, true)?)
}

/// Decodes the return values of a `sol!` generated call.
pub fn decode_call_return<C: SolCall>(data: &[u8]) -> Result<C::Return, BatchError> {
    non_empty(data)?;
    Ok(C::abi_decode_returns(data, true)?)
}

/// Decodes a `try_aggregate` element, falling back to `default` when the call failed, returned
/// nothing or could not be parsed.
pub fn general_decoder<T>(
    result: &MultiResult<Bytes>,
    default: T,
    parse: impl FnOnce(&[u8]) -> Result<T, BatchError>,
) -> T {
    match result.return_data.as_ref() {
        Some(data) if result.success && !data.is_empty() => parse(data).unwrap_or_else(|err| {
            tracing::warn!(target = "amms_sync::batch", ?err, "Falling back to default value");
            default
        }),
        _ => default,
    }
}

fn non_empty(data: &[u8]) -> Result<(), BatchError> {
    if data.is_empty() {
        Err(BatchError::EmptyReturnData)
    } else {
        Ok(())
    }
}
