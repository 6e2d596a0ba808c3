use alloy::{
    primitives::{Address, U256},
    sol,
    sol_types::SolEvent,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    consts::{U256_FEE_ONE, U32_FEE_ONE},
    error::AMMError,
    PricingStrategy, Token,
};
use crate::{
    batch::{BatchReader, MultiCallParams, DEFAULT_BATCH_SIZE},
    state::PoolState,
    subscriber::{error::SubscriberError, process_decoded, EventDecoder, EventHandler},
    types::{BlockHeader, LogEvent},
};

sol!(
#[derive(Debug, PartialEq, Eq)]
#[sol(rpc)]
contract IUniswapV2Pair {
    event Sync(uint112 reserve0, uint112 reserve1);
    function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast);
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reserves {
    pub reserve_0: u128,
    pub reserve_1: u128,
}

impl PoolState for Reserves {}

#[derive(Debug)]
pub enum UniswapV2Event {
    Sync(IUniswapV2Pair::Sync),
}

impl EventDecoder for UniswapV2Event {
    fn decode_log(log: &LogEvent) -> Result<Option<Self>, alloy::sol_types::Error> {
        if log.signature() == Some(&IUniswapV2Pair::Sync::SIGNATURE_HASH) {
            let event =
                IUniswapV2Pair::Sync::decode_raw_log(log.topics.iter().copied(), &log.data, true)?;
            return Ok(Some(Self::Sync(event)));
        }
        Ok(None)
    }
}

/// Constant product pool kept in sync through its `Sync` events.
#[derive(Debug, Clone)]
pub struct UniswapV2Pool {
    pub address: Address,
    pub token_a: Token,
    pub token_b: Token,
    /// Fee in hundredths of a basis point, e.g. 3000 for 0.3%.
    fee: u32,
    name: String,
    reader: BatchReader,
}

impl UniswapV2Pool {
    pub fn new(
        address: Address,
        token_a: Token,
        token_b: Token,
        fee: u32,
        reader: BatchReader,
    ) -> Result<Self, AMMError> {
        if fee >= U32_FEE_ONE {
            return Err(AMMError::InvalidFee { fee });
        }

        Ok(Self {
            address,
            token_a,
            token_b,
            fee,
            name: format!("uniswap_v2:{address}"),
            reader,
        })
    }

    pub fn fee(&self) -> u32 {
        self.fee
    }

    /// Calculates the amount received for a given `amount_in` `reserve_in` and `reserve_out`.
    pub fn get_amount_out(&self, amount_in: U256, reserve_in: U256, reserve_out: U256) -> U256 {
        if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
            return U256::ZERO;
        }

        let fee = U32_FEE_ONE - self.fee;
        let amount_in_with_fee = amount_in * U256::from(fee);
        let numerator = amount_in_with_fee * reserve_out;
        let denominator = reserve_in * U256_FEE_ONE + amount_in_with_fee;

        numerator / denominator
    }

    pub fn tokens(&self) -> [Address; 2] {
        [self.token_a.address, self.token_b.address]
    }
}

impl PricingStrategy for UniswapV2Pool {
    type State = Reserves;

    fn compute_output_amount(
        &self,
        state: &Reserves,
        i: usize,
        j: usize,
        amount: U256,
    ) -> Result<U256, AMMError> {
        let (reserve_in, reserve_out) = match (i, j) {
            (0, 1) => (state.reserve_0, state.reserve_1),
            (1, 0) => (state.reserve_1, state.reserve_0),
            _ => return Err(AMMError::IncompatibleToken),
        };

        Ok(self.get_amount_out(amount, U256::from(reserve_in), U256::from(reserve_out)))
    }
}

#[async_trait]
impl EventHandler for UniswapV2Pool {
    type State = Reserves;

    fn name(&self) -> &str {
        &self.name
    }

    fn addresses_subscribed(&self) -> Vec<Address> {
        vec![self.address]
    }

    fn process_log(
        &self,
        state: &Reserves,
        log: &LogEvent,
        _header: &BlockHeader,
    ) -> Option<Reserves> {
        process_decoded(&self.name, state, log, |_, event| match event {
            UniswapV2Event::Sync(sync) => {
                let reserves = Reserves {
                    reserve_0: sync.reserve0.to::<u128>(),
                    reserve_1: sync.reserve1.to::<u128>(),
                };

                tracing::trace!(
                    target = "amms_sync::uniswap_v2",
                    address = ?self.address,
                    reserve_0 = reserves.reserve_0,
                    reserve_1 = reserves.reserve_1,
                    "Sync"
                );

                Some(reserves)
            }
        })
    }

    async fn generate_state(&self, block_number: u64) -> Result<Reserves, SubscriberError> {
        let calls = [MultiCallParams::from_call(
            self.address,
            &IUniswapV2Pair::getReservesCall {},
        )];

        let mut outputs = self
            .reader
            .aggregate(&calls, Some(block_number), DEFAULT_BATCH_SIZE)
            .await?;

        let reserves = outputs
            .pop()
            .ok_or(SubscriberError::UnexpectedOutputCount {
                expected: 1,
                actual: 0,
            })??;

        Ok(Reserves {
            reserve_0: reserves.reserve0.to::<u128>(),
            reserve_1: reserves.reserve1.to::<u128>(),
        })
    }
}
