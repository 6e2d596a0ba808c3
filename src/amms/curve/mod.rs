pub mod math;

use std::{borrow::Cow, sync::Arc, time::Duration};

use alloy::{
    primitives::{Address, Bytes, U256},
    sol,
    sol_types::SolCall,
};
use math::{add, div, mul, sub, ImplementationName, StableSwapMath};
use serde::{Deserialize, Serialize};

use super::{
    consts::{FEE_DENOMINATOR, PRECISION, U256_1, U256_2},
    error::AMMError,
    PricingStrategy, Token,
};
use crate::{
    batch::{
        decoders::{decode_call_return, decode_uint256},
        MultiResult, RawCall,
    },
    polling::{error::PollingError, PoolPoller},
    state::{PoolState, Snapshot, StateStore},
};

sol!(
#[derive(Debug, PartialEq, Eq)]
#[sol(rpc)]
contract ICurveFactory {
    function get_fees(address pool) external view returns (uint256, uint256);
    function get_balances(address pool) external view returns (uint256[4]);
}

#[derive(Debug, PartialEq, Eq)]
#[sol(rpc)]
contract ICurvePool {
    function A() external view returns (uint256);
    function A_precise() external view returns (uint256);
    function get_virtual_price() external view returns (uint256);
}

#[derive(Debug, PartialEq, Eq)]
#[sol(rpc)]
contract ICurveLpToken {
    function totalSupply() external view returns (uint256);
});

/// Polled state of a StableSwap pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurveState {
    /// Amplification as used by the pool math, see [`StableSwapMath`].
    pub a: U256,
    /// Swap fee, over `FEE_DENOMINATOR`.
    pub fee: U256,
    pub balances: Vec<U256>,
    /// Meta pools only.
    pub base_pool: Option<Box<BasePoolState>>,
}

impl PoolState for CurveState {}

/// Base pool state embedded in a meta pool, read at the same block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasePoolState {
    pub state: CurveState,
    /// Virtual price of the base pool LP token, the last coin of the meta pool.
    pub virtual_price: U256,
    pub lp_total_supply: U256,
}

/// Constants a StableSwap pool is priced with.
#[derive(Debug, Clone)]
pub struct CurvePool {
    pub implementation: ImplementationName,
    math: &'static dyn StableSwapMath,
    rates: Vec<U256>,
}

impl CurvePool {
    pub fn new(implementation: ImplementationName, decimals: &[u8]) -> Self {
        let math = implementation.math();
        Self {
            implementation,
            math,
            rates: math.compute_scaling_factors(decimals),
        }
    }

    pub fn n_coins(&self) -> usize {
        self.rates.len()
    }

    pub fn rates(&self) -> &[U256] {
        &self.rates
    }

    /// Rates with the base pool LP token valued at its virtual price.
    fn rates_for<'a>(&'a self, state: &CurveState) -> Cow<'a, [U256]> {
        match (&state.base_pool, self.rates.split_last()) {
            (Some(base), Some((_, coins))) => {
                Cow::Owned(coins.iter().copied().chain([base.virtual_price]).collect())
            }
            _ => Cow::Borrowed(self.rates.as_slice()),
        }
    }
}

impl PricingStrategy for CurvePool {
    type State = CurveState;

    fn compute_output_amount(
        &self,
        state: &CurveState,
        i: usize,
        j: usize,
        amount: U256,
    ) -> Result<U256, AMMError> {
        let rates = self.rates_for(state);
        self.math
            .compute_output_amount(state.a, state.fee, &rates, &state.balances, i, j, amount)
    }
}

/// Prices a meta pool between its underlying coins: the meta pool coins but the last, followed
/// by the coins of the base pool.
#[derive(Debug, Clone, Copy)]
pub struct CurveUnderlyingPool<'a> {
    meta: &'a CurvePool,
    base: &'a CurvePool,
}

impl<'a> CurveUnderlyingPool<'a> {
    pub fn new(meta: &'a CurvePool, base: &'a CurvePool) -> Self {
        Self { meta, base }
    }

    pub fn n_coins(&self) -> usize {
        self.meta.n_coins().saturating_sub(1) + self.base.n_coins()
    }
}

impl PricingStrategy for CurveUnderlyingPool<'_> {
    type State = CurveState;

    /// `get_dy_underlying`. Swaps between two base pool coins are priced by the base pool alone.
    fn compute_output_amount(
        &self,
        state: &CurveState,
        i: usize,
        j: usize,
        amount: U256,
    ) -> Result<U256, AMMError> {
        let n_coins = self.n_coins();
        if i == j || i >= n_coins || j >= n_coins || self.meta.n_coins() < 2 {
            return Err(AMMError::InvalidCoinIndex { i, j, n_coins });
        }
        let base = state
            .base_pool
            .as_deref()
            .ok_or(AMMError::MissingBasePoolState)?;

        // Index of the base pool LP token in the meta pool
        let max_coin = self.meta.n_coins() - 1;
        if i >= max_coin && j >= max_coin {
            return self
                .base
                .compute_output_amount(&base.state, i - max_coin, j - max_coin, amount);
        }

        let rates = self.meta.rates_for(state);
        let xp = self.meta.math.compute_xp(&rates, &state.balances)?;

        let x = if i < max_coin {
            add(xp[i], div(mul(amount, rates[i])?, PRECISION)?)?
        } else {
            let mut inputs = vec![U256::ZERO; self.base.n_coins()];
            inputs[i - max_coin] = amount;
            let minted = self.base.math.compute_token_amount(
                base.state.a,
                &self.base.rates,
                &base.state.balances,
                base.lp_total_supply,
                &inputs,
                true,
            )?;
            let x = div(mul(minted, rates[max_coin])?, PRECISION)?;
            // Deposit fee, approximately
            let x = sub(x, div(mul(x, base.state.fee)?, mul(U256_2, FEE_DENOMINATOR)?)?)?;
            add(x, xp[max_coin])?
        };

        let (meta_i, meta_j) = (i.min(max_coin), j.min(max_coin));
        let y = self.meta.math.compute_y(meta_i, meta_j, x, &xp, state.a)?;
        let dy = sub(sub(xp[meta_j], y)?, U256_1)?;
        let dy = sub(dy, div(mul(dy, state.fee)?, FEE_DENOMINATOR)?)?;

        if j < max_coin {
            return div(mul(dy, PRECISION)?, rates[j]);
        }
        self.base.math.compute_withdraw_one_coin(
            base.state.a,
            base.state.fee,
            &self.base.rates,
            &base.state.balances,
            base.lp_total_supply,
            div(mul(dy, PRECISION)?, rates[max_coin])?,
            j - max_coin,
        )
    }
}

/// Polls a factory deployed StableSwap pool.
///
/// Amplification is read from the pool, fees and balances from the factory. Meta pools
/// additionally read the virtual price of their base pool and the supply of its LP token, and
/// embed the base pool state, which must have been polled before.
#[derive(Debug)]
pub struct CurveFactoryPoller {
    identifier: String,
    address: Address,
    factory: Address,
    pool: CurvePool,
    coins: Vec<Address>,
    underlying_coins: Vec<Address>,
    used_for_pricing: bool,
    src_fee_on_transfer_supported: bool,
    base_pool: Option<Arc<CurveFactoryPoller>>,
    store: StateStore<CurveState>,
    max_state_age: Option<Duration>,
}

impl CurveFactoryPoller {
    pub fn new(
        identifier: impl Into<String>,
        address: Address,
        factory: Address,
        implementation: ImplementationName,
        coins: &[Token],
    ) -> Self {
        let decimals = coins.iter().map(Token::decimals).collect::<Vec<_>>();
        Self {
            identifier: identifier.into(),
            address,
            factory,
            pool: CurvePool::new(implementation, &decimals),
            coins: coins.iter().map(|coin| coin.address).collect(),
            underlying_coins: vec![],
            used_for_pricing: true,
            src_fee_on_transfer_supported: false,
            base_pool: None,
            store: StateStore::new(),
            max_state_age: None,
        }
    }

    /// Makes this a meta pool over `base_pool`, whose LP token must be the last coin.
    pub fn with_base_pool(mut self, base_pool: Arc<CurveFactoryPoller>) -> Self {
        self.underlying_coins = self
            .coins
            .split_last()
            .map(|(_, coins)| coins.to_vec())
            .unwrap_or_default();
        self.underlying_coins.extend_from_slice(&base_pool.coins);
        self.base_pool = Some(base_pool);
        self
    }

    /// Polled only to support pricing of other pools.
    pub fn state_only(mut self) -> Self {
        self.used_for_pricing = false;
        self
    }

    pub fn with_fee_on_transfer_support(mut self) -> Self {
        self.src_fee_on_transfer_supported = true;
        self
    }

    pub fn with_max_state_age(mut self, max_state_age: Duration) -> Self {
        self.max_state_age = Some(max_state_age);
        self
    }

    pub fn pool(&self) -> &CurvePool {
        &self.pool
    }

    pub fn is_meta_pool(&self) -> bool {
        self.base_pool.is_some()
    }

    /// Pricing between [`PoolPoller::underlying_tokens`], meta pools only.
    pub fn underlying_pool(&self) -> Option<CurveUnderlyingPool<'_>> {
        self.base_pool
            .as_ref()
            .map(|base_pool| CurveUnderlyingPool::new(&self.pool, &base_pool.pool))
    }

    pub fn get_state(&self, block_number: Option<u64>) -> Option<Snapshot<CurveState>> {
        self.store.get_state(block_number)
    }

    fn expected_results(&self) -> usize {
        if self.is_meta_pool() {
            5
        } else {
            3
        }
    }

    fn output<'a>(
        &self,
        results: &'a [MultiResult<Bytes>],
        index: usize,
    ) -> Result<&'a [u8], PollingError> {
        results
            .get(index)
            .and_then(|result| result.return_data.as_ref())
            .map(|data| &data[..])
            .ok_or_else(|| PollingError::FailedCalls {
                identifier: self.identifier.clone(),
                failed: 1,
                total: results.len(),
            })
    }
}

impl PoolPoller<CurveState> for CurveFactoryPoller {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn address(&self) -> Address {
        self.address
    }

    fn is_used_for_pricing(&self) -> bool {
        self.used_for_pricing
    }

    fn is_src_fee_on_transfer_supported(&self) -> bool {
        self.src_fee_on_transfer_supported
    }

    fn tokens(&self) -> &[Address] {
        &self.coins
    }

    fn underlying_tokens(&self) -> &[Address] {
        &self.underlying_coins
    }

    fn state_calls(&self) -> Vec<RawCall> {
        let a = if self.pool.implementation.has_a_precise() {
            ICurvePool::A_preciseCall {}.abi_encode()
        } else {
            ICurvePool::ACall {}.abi_encode()
        };

        let mut calls = vec![
            RawCall {
                target: self.address,
                call_data: a.into(),
            },
            RawCall {
                target: self.factory,
                call_data: ICurveFactory::get_feesCall { pool: self.address }
                    .abi_encode()
                    .into(),
            },
            RawCall {
                target: self.factory,
                call_data: ICurveFactory::get_balancesCall { pool: self.address }
                    .abi_encode()
                    .into(),
            },
        ];

        if let (Some(base_pool), Some(lp_token)) = (&self.base_pool, self.coins.last()) {
            calls.push(RawCall {
                target: base_pool.address,
                call_data: ICurvePool::get_virtual_priceCall {}.abi_encode().into(),
            });
            calls.push(RawCall {
                target: *lp_token,
                call_data: ICurveLpToken::totalSupplyCall {}.abi_encode().into(),
            });
        }

        calls
    }

    fn parse_results(
        &self,
        results: &[MultiResult<Bytes>],
        _block_number: u64,
        _updated_at: u64,
    ) -> Result<CurveState, PollingError> {
        let expected = self.expected_results();
        if results.len() != expected {
            return Err(PollingError::UnexpectedResultCount {
                identifier: self.identifier.clone(),
                expected,
                actual: results.len(),
            });
        }

        let failed = results.iter().filter(|result| !result.success).count();
        if failed > 0 {
            return Err(PollingError::FailedCalls {
                identifier: self.identifier.clone(),
                failed,
                total: results.len(),
            });
        }

        let a = decode_uint256(self.output(results, 0)?)?;
        // [fee, admin_fee]
        let fee = decode_call_return::<ICurveFactory::get_feesCall>(self.output(results, 1)?)?._0;
        let balances =
            decode_call_return::<ICurveFactory::get_balancesCall>(self.output(results, 2)?)?._0;

        let base_pool = match &self.base_pool {
            Some(base_pool) => {
                let virtual_price = decode_uint256(self.output(results, 3)?)?;
                let lp_total_supply = decode_uint256(self.output(results, 4)?)?;
                let base_state = base_pool.store.get_state(None).ok_or_else(|| {
                    PollingError::MissingBaseState {
                        identifier: self.identifier.clone(),
                    }
                })?;
                Some(Box::new(BasePoolState {
                    state: base_state.state.as_ref().clone(),
                    virtual_price,
                    lp_total_supply,
                }))
            }
            None => None,
        };

        Ok(CurveState {
            a,
            fee,
            balances: balances.into_iter().take(self.pool.n_coins()).collect(),
            base_pool,
        })
    }

    fn store(&self) -> &StateStore<CurveState> {
        &self.store
    }

    fn max_state_age(&self) -> Option<Duration> {
        self.max_state_age
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use alloy::{
        primitives::{address, Address, Bytes, U256},
        sol_types::{SolCall, SolValue},
    };

    use super::*;
    use crate::{
        amms::{consts::PRECISION, quote_pools, QuoteCandidate},
        batch::{testing::MockMulticall, BatchReader},
        config::EngineConfig,
        polling::{cache::InMemoryCache, PollingPoolManager},
    };

    const FACTORY: Address = address!("B9fC157394Af804a3578134A6585C0dc9cc990d4");
    const BASE: Address = address!("bEbc44782C7dB0a1A60Cb6fe97d0b483032FF1C7");
    const META: Address = address!("Ed279fDD11cA84bEef15AF5D39BB4d4bEE23F0cA");
    const BROKEN: Address = address!("00000000000000000000000000000000000000bb");

    fn e18(value: u64) -> U256 {
        U256::from(value) * PRECISION
    }

    fn token(last_byte: u8, decimals: u8) -> Token {
        Token::new_with_decimals(Address::with_last_byte(last_byte), decimals)
    }

    /// Serves `A`, fees and balances of BASE and META, and the supply of the BASE LP token. Only
    /// the virtual price of BROKEN is readable.
    fn chain() -> Arc<MockMulticall> {
        Arc::new(MockMulticall::new(|call, _| {
            let selector: [u8; 4] = call.call_data.get(..4)?.try_into().ok()?;
            let encoded = if selector == ICurvePool::ACall::SELECTOR && call.target == BASE {
                U256::from(2_000).abi_encode()
            } else if selector == ICurvePool::A_preciseCall::SELECTOR && call.target == META {
                U256::from(500 * 100).abi_encode()
            } else if selector == ICurvePool::get_virtual_priceCall::SELECTOR
                && (call.target == BASE || call.target == BROKEN)
            {
                U256::from(1_020_000_000_000_000_000_u64).abi_encode()
            } else if selector == ICurveLpToken::totalSupplyCall::SELECTOR
                && call.target == Address::with_last_byte(5)
            {
                e18(250_000_000).abi_encode()
            } else if selector == ICurveFactory::get_feesCall::SELECTOR {
                let pool = ICurveFactory::get_feesCall::abi_decode(&call.call_data, true)
                    .ok()?
                    .pool;
                let fee = if pool == BASE { 1_000_000 } else { 4_000_000 };
                (U256::from(fee), U256::from(5_000_000_000_u64)).abi_encode_sequence()
            } else if selector == ICurveFactory::get_balancesCall::SELECTOR {
                let pool = ICurveFactory::get_balancesCall::abi_decode(&call.call_data, true)
                    .ok()?
                    .pool;
                let balances = if pool == BASE {
                    [
                        e18(120_000_000),
                        U256::from(95_000_000_000_000_u64),
                        U256::from(40_000_000_000_000_u64),
                        U256::ZERO,
                    ]
                } else if pool == META {
                    [e18(5_000_000), e18(4_800_000), U256::ZERO, U256::ZERO]
                } else {
                    return None;
                };
                balances.abi_encode()
            } else {
                return None;
            };
            Some(Bytes::from(encoded))
        }))
    }

    fn base_pool() -> CurveFactoryPoller {
        CurveFactoryPoller::new(
            "3pool",
            BASE,
            FACTORY,
            ImplementationName::Legacy,
            &[token(1, 18), token(2, 6), token(3, 6)],
        )
    }

    fn meta_pool(base: Arc<CurveFactoryPoller>) -> CurveFactoryPoller {
        CurveFactoryPoller::new(
            "lusd-3crv",
            META,
            FACTORY,
            ImplementationName::FactoryPlain,
            &[token(4, 18), token(5, 18)],
        )
        .with_base_pool(base)
    }

    #[test]
    fn test_state_calls() {
        let base = Arc::new(base_pool());
        let meta = meta_pool(base.clone());

        let calls = base.state_calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(&calls[0].call_data[..], &ICurvePool::ACall::SELECTOR[..]);
        assert_eq!(calls[1].target, FACTORY);

        let calls = meta.state_calls();
        assert_eq!(calls.len(), 5);
        assert_eq!(&calls[0].call_data[..], &ICurvePool::A_preciseCall::SELECTOR[..]);
        assert_eq!(calls[3].target, BASE);
        // The LP token of the base pool is the last meta pool coin
        assert_eq!(calls[4].target, Address::with_last_byte(5));

        let underlying = (1..=4).map(Address::with_last_byte).collect::<Vec<_>>();
        let mut expected = underlying[3..].to_vec();
        expected.extend_from_slice(&underlying[..3]);
        assert_eq!(meta.underlying_tokens(), &expected[..]);
        assert!(meta.supports_pair(Address::with_last_byte(4), Address::with_last_byte(2)));
        assert!(!meta.supports_pair(Address::with_last_byte(5), Address::with_last_byte(2)));
    }

    #[tokio::test]
    async fn test_meta_pool_polling_and_pricing() -> eyre::Result<()> {
        let manager = PollingPoolManager::new(
            "curve-v1-factory",
            EngineConfig::default(),
            BatchReader::new(chain()),
            Arc::new(InMemoryCache::new()),
        );

        let base = Arc::new(base_pool().state_only());
        let meta = Arc::new(meta_pool(base.clone()));
        manager.initialize_new_pool(meta.clone())?;
        manager.initialize_new_pool_for_state(base.clone())?;

        manager.update_pools_in_batch(Some(18_000_000)).await?;

        let base_state = base.get_state(None).unwrap();
        assert_eq!(base_state.state.a, U256::from(2_000));
        assert_eq!(base_state.state.fee, U256::from(1_000_000));
        assert_eq!(base_state.state.balances.len(), 3);

        let snapshot = meta.get_state(Some(18_000_000)).unwrap();
        assert_eq!(snapshot.state.a, U256::from(50_000));
        assert_eq!(snapshot.state.balances, vec![e18(5_000_000), e18(4_800_000)]);
        let embedded = snapshot.state.base_pool.as_deref().unwrap();
        assert_eq!(embedded.virtual_price, U256::from(1_020_000_000_000_000_000_u64));
        assert_eq!(embedded.lp_total_supply, e18(250_000_000));
        assert_eq!(&embedded.state, base_state.state.as_ref());

        // Base pools are never offered for pricing
        let pools = manager.get_pools_for_pair(
            Address::with_last_byte(4),
            Address::with_last_byte(5),
            false,
        );
        assert_eq!(pools.len(), 1);

        let quotes = quote_pools(
            [QuoteCandidate {
                identifier: "lusd-3crv",
                pricing: meta.pool(),
                snapshot: pools[0].get_state(None),
                i: 0,
                j: 1,
            }],
            &[e18(1_000)],
        );
        // 1000 LUSD buys a bit less than 1000 / 1.02 3CRV
        let out = quotes[0].amounts_out[0];
        assert!(out < e18(1_000) * U256::from(100) / U256::from(102));
        assert!(out > e18(970));
        Ok(())
    }

    #[tokio::test]
    async fn test_underlying_pricing() -> eyre::Result<()> {
        let manager = PollingPoolManager::new(
            "curve-v1-factory",
            EngineConfig::default(),
            BatchReader::new(chain()),
            Arc::new(InMemoryCache::new()),
        );

        let base = Arc::new(base_pool().state_only());
        let meta = Arc::new(meta_pool(base.clone()));
        manager.initialize_new_pool_for_state(base.clone())?;
        manager.initialize_new_pool(meta.clone())?;
        manager.update_pools_in_batch(Some(18_000_000)).await?;

        let state = meta.get_state(None).unwrap().state;
        let underlying = meta.underlying_pool().unwrap();
        assert_eq!(underlying.n_coins(), 4);
        assert!(base.underlying_pool().is_none());

        // [LUSD, DAI, USDC, USDT]
        let usdc = underlying.compute_output_amount(&state, 0, 2, e18(1_000))?;
        assert!(usdc > U256::from(990_000_000_u64));
        assert!(usdc < U256::from(1_005_000_000_u64));

        let lusd = underlying.compute_output_amount(&state, 2, 0, U256::from(1_000_000_000_u64))?;
        assert!(lusd > e18(990));
        assert!(lusd < e18(1_005));

        // DAI to USDT never touches the meta pool
        let base_state = base.get_state(None).unwrap().state;
        assert_eq!(
            underlying.compute_output_amount(&state, 1, 3, e18(1_000))?,
            base.pool().compute_output_amount(&base_state, 0, 2, e18(1_000))?
        );

        assert_eq!(
            underlying.compute_output_amount(&state, 0, 4, e18(1)),
            Err(AMMError::InvalidCoinIndex { i: 0, j: 4, n_coins: 4 })
        );
        let detached = CurveState {
            base_pool: None,
            ..state.as_ref().clone()
        };
        assert_eq!(
            underlying.compute_output_amount(&detached, 0, 2, e18(1)),
            Err(AMMError::MissingBasePoolState)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_meta_pool_without_base_state_is_stale() -> eyre::Result<()> {
        let manager = PollingPoolManager::new(
            "curve-v1-factory",
            EngineConfig::default(),
            BatchReader::new(chain()),
            Arc::new(InMemoryCache::new()),
        );

        // Base pool state can not be read, its virtual price can
        let base = Arc::new(
            CurveFactoryPoller::new(
                "broken",
                BROKEN,
                FACTORY,
                ImplementationName::Legacy,
                &[token(1, 18), token(2, 6), token(3, 6)],
            )
            .state_only(),
        );
        let meta = Arc::new(
            CurveFactoryPoller::new(
                "meta",
                META,
                FACTORY,
                ImplementationName::FactoryPlain,
                &[token(4, 18), token(5, 18)],
            )
            .with_base_pool(base.clone()),
        );
        manager.initialize_new_pool_for_state(base)?;
        manager.initialize_new_pool(meta.clone())?;

        manager.update_pools_in_batch(Some(1)).await?;

        assert!(meta.get_state(None).is_none());
        assert!(manager.get_pool("meta", false).unwrap().is_stale());

        let results = [
            U256::from(50_000).abi_encode(),
            (U256::from(4_000_000), U256::ZERO).abi_encode_sequence(),
            [e18(1), e18(1), U256::ZERO, U256::ZERO].abi_encode(),
            e18(1).abi_encode(),
            e18(1).abi_encode(),
        ]
        .map(|data| MultiResult::ok(Bytes::from(data)));
        assert!(matches!(
            meta.parse_results(&results, 1, 0),
            Err(PollingError::MissingBaseState { .. })
        ));

        let results = vec![MultiResult::ok(Bytes::new()); 5];
        assert!(matches!(
            meta.parse_results(&results, 1, 0),
            Err(PollingError::BatchError(_))
        ));
        Ok(())
    }
}
